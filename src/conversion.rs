//! Human-readable number shortening for log lines and summaries

const NUMBER_SUFFIXES: &[&str] = &["", "K", "M", "B", "T", "Qa", "Qi"];
const DATA_SUFFIXES: &[&str] = &["", "k", "M", "G", "T", "Qa", "Qi"];

/// Shorten a count using powers of 1000 (`1500` -> `"1.5K"`)
pub fn number_shorten(number: f64, precision: usize) -> String {
    shorten(number, precision, 1000.0, NUMBER_SUFFIXES)
}

/// Shorten a byte size using powers of 1024 (`2048` -> `"2k"`)
pub fn data_shorten(number: f64, precision: usize) -> String {
    shorten(number, precision, 1024.0, DATA_SUFFIXES)
}

fn shorten(number: f64, precision: usize, base: f64, suffixes: &[&str]) -> String {
    let mut divisor = 1.0;
    let mut suffix = suffixes[0];
    for (i, candidate) in suffixes.iter().enumerate() {
        divisor = base.powi(i as i32);
        suffix = candidate;
        if number.abs() < divisor * base {
            break;
        }
    }

    let formatted = format!("{:.*}", precision, number / divisor);
    format!("{}{}", trim_zeros(&formatted), suffix)
}

/// Drop trailing fractional zeros and a dangling decimal point
fn trim_zeros(formatted: &str) -> &str {
    if !formatted.contains('.') {
        return formatted;
    }
    formatted.trim_end_matches('0').trim_end_matches('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_shorten() {
        assert_eq!(number_shorten(0.0, 2), "0");
        assert_eq!(number_shorten(999.0, 2), "999");
        assert_eq!(number_shorten(1500.0, 2), "1.5K");
        assert_eq!(number_shorten(2_000_000.0, 2), "2M");
        assert_eq!(number_shorten(1_234_567_890.0, 2), "1.23B");
        assert_eq!(number_shorten(-4200.0, 1), "-4.2K");
    }

    #[test]
    fn test_data_shorten() {
        assert_eq!(data_shorten(512.0, 2), "512");
        assert_eq!(data_shorten(2048.0, 2), "2k");
        assert_eq!(data_shorten(1536.0, 2), "1.5k");
        assert_eq!(data_shorten(3.0 * 1024.0 * 1024.0, 2), "3M");
    }

    #[test]
    fn test_precision_zero_keeps_integers() {
        assert_eq!(number_shorten(100.0, 0), "100");
        assert_eq!(data_shorten(10240.0, 0), "10k");
    }

    #[test]
    fn test_largest_suffix_caps_growth() {
        let huge = 1000f64.powi(8);
        assert!(number_shorten(huge, 0).ends_with("Qi"));
    }
}
