//! Index keys derived from data records.

use crate::btree::Mode;
use crate::record::{Record, RecordBuilder, Value};

/// Builds the index key for `rec`: the listed fields in order, then the
/// record address unless the index is [`Mode::Unique`].
pub fn key(rec: &Record, columns: &[u32], adr: u64, mode: Mode) -> Record {
    let mut builder = RecordBuilder::new();
    for &col in columns {
        builder.add_field(rec, col as usize);
    }
    if mode != Mode::Unique {
        builder.add(Value::Int(adr as i64));
    }
    builder.build()
}

/// The column part of a key, without its trailing address.
pub fn strip(key: &Record) -> Record {
    RecordBuilder::prefix(key, key.size().saturating_sub(1)).build()
}

/// The column values of `rec` for `columns`, the form lookups take.
pub fn project(rec: &Record, columns: &[u32]) -> Record {
    let mut builder = RecordBuilder::new();
    for &col in columns {
        builder.add_field(rec, col as usize);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_per_mode() -> crate::Result<()> {
        let rec = Record::from_values([Value::from("a"), Value::from("b"), Value::from("c")]);

        let k = key(&rec, &[2, 0], 440, Mode::Key);
        assert_eq!(k.size(), 3);
        assert_eq!(k.get_string(0)?, "c");
        assert_eq!(k.get_string(1)?, "a");
        assert_eq!(k.get_int(2)?, 440);
        assert_eq!(strip(&k), project(&rec, &[2, 0]));

        let u = key(&rec, &[1], 440, Mode::Unique);
        assert_eq!(u, Record::from_values(["b"]));

        let d = key(&rec, &[1], 440, Mode::Dups);
        assert_eq!(strip(&d), u);
        Ok(())
    }

    #[test]
    fn test_missing_fields_are_empty() -> crate::Result<()> {
        let rec = Record::from_values(["only"]);
        let k = key(&rec, &[0, 5], 16, Mode::Key);
        assert_eq!(k.size(), 3);
        assert!(k.get_raw(1).is_empty());
        Ok(())
    }
}
