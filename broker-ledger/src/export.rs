//! CSV export projection of the ledger.

use chrono::SecondsFormat;
use std::io::Write;

use broker_domain::LedgerEntry;

use crate::types::Result;

/// Column header of the export.
pub const CSV_HEADER: &str = "ID,Time,User ID,Type,Amount,Balance Before,Balance After,Reason,Operator,IP Address,Device Info,Hash";

/// Write entries as CSV, header first. Money columns carry two fractional digits.
pub fn write_csv<'a, W, I>(writer: &mut W, entries: I) -> Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    writeln!(writer, "{}", CSV_HEADER)?;
    for e in entries {
        writeln!(
            writer,
            "{},{},{},{},{:.2},{:.2},{:.2},{},{},{},{},{}",
            e.id,
            e.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            e.user_id,
            e.kind,
            e.amount,
            e.balance_before,
            e.balance_after,
            escape(&e.reason),
            escape(&e.operator),
            escape(&e.ip),
            escape(&e.device),
            e.hash,
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Render entries as a CSV string.
pub fn to_csv<'a, I>(entries: I) -> Result<String>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut buf = Vec::new();
    write_csv(&mut buf, entries)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn escape(field: &str) -> std::borrow::Cow<'_, str> {
    if field.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        format!("\"{}\"", field.replace('"', "\"\"")).into()
    } else {
        field.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::{NewLedgerEntry, TransactionKind};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn test_export_layout() {
        let entry = NewLedgerEntry {
            created_at: Utc.timestamp_millis_opt(1_700_000_000_123).unwrap(),
            user_id: 7,
            amount: dec!(10),
            balance_before: dec!(0.5),
            balance_after: dec!(10.5),
            reason: "Refund for task 3 failure, \"late\"".to_string(),
            operator: "system".to_string(),
            operator_id: 0,
            kind: TransactionKind::UserRefund,
            ip: "10.0.0.1".to_string(),
            device: String::new(),
            hash: "ab12".to_string(),
        }
        .into_entry(99);

        let csv = to_csv([&entry]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert_eq!(
            lines.next(),
            Some(
                "99,2023-11-14T22:13:20.123Z,7,user_refund,10.00,0.50,10.50,\
                 \"Refund for task 3 failure, \"\"late\"\"\",system,10.0.0.1,,ab12"
            )
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn test_empty_export_is_header_only() {
        let csv = to_csv(std::iter::empty()).unwrap();
        assert_eq!(csv, format!("{}\n", CSV_HEADER));
    }
}
