use chrono::NaiveDate;

/// Format an invoice identifier from a drawn sequence value.
///
/// `F-<YYYYMM>-<seq zero-padded to 5 digits>`. The month segment is purely
/// cosmetic: the sequence is monotonic for the lifetime of the deployment and
/// is never reset by month rollover, so identifiers stay globally unique.
pub fn format_invoice_number(seq: u64, on: NaiveDate) -> String {
    format!("F-{}-{seq:05}", on.format("%Y%m"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn formats_month_and_padding() {
        assert_eq!(format_invoice_number(1, d(2025, 6, 15)), "F-202506-00001");
        assert_eq!(format_invoice_number(42, d(2025, 12, 1)), "F-202512-00042");
    }

    #[test]
    fn sequence_survives_month_rollover() {
        // Only the printed month changes; the counter keeps climbing.
        let dec = format_invoice_number(99, d(2025, 12, 31));
        let jan = format_invoice_number(100, d(2026, 1, 1));
        assert_eq!(dec, "F-202512-00099");
        assert_eq!(jan, "F-202601-00100");
    }

    #[test]
    fn wide_counters_keep_growing() {
        assert_eq!(format_invoice_number(123456, d(2025, 6, 1)), "F-202506-123456");
    }
}
