use std::fmt::Display;

pub(crate) fn try_into_human_readable<N: Into<u64>>(original: N) -> (f64, char) {
    let mut number = original.into() as f64;
    const SUFFIXES: [char; 7] = ['B', 'K', 'M', 'G', 'T', 'P', 'E'];
    let mut suffix_id = 0;
    while number >= 1024.0 && suffix_id < SUFFIXES.len() - 1 {
        number /= 1024.0;
        suffix_id += 1;
    }
    (number, SUFFIXES[suffix_id])
}

/// Byte count that prints like `1.50M (0x180000)`
pub(crate) struct HumanSize(pub(crate) u64);

impl Display for HumanSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (number, suffix) = try_into_human_readable(self.0);
        write!(f, "{:.2}{} (0x{:x})", number, suffix, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_to_largest_suffix() {
        assert_eq!(try_into_human_readable(512u32), (512.0, 'B'));
        assert_eq!(try_into_human_readable(0x180000u32), (1.5, 'M'));
        assert_eq!(HumanSize(0x180000).to_string(), "1.50M (0x180000)");
        assert_eq!(try_into_human_readable(u64::MAX).1, 'E');
    }
}
