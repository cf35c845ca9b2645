//! Handling of lists of test ids.
//!
//! Test id lists travel two ways: as plain newline-separated text files
//! handed to workers via `$IDFILE`, and as subunit enumeration streams
//! produced by `$LISTOPT` invocations.

use std::io::{self, Write};

use crate::subunit::{self, TestStatus};

/// Writes `test_ids` to `sink`, one per line with a trailing newline.
pub fn write_list<W, I, S>(sink: &mut W, test_ids: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for id in test_ids {
        sink.write_all(id.as_ref().as_bytes())?;
        sink.write_all(b"\n")?;
    }
    Ok(())
}

/// Parses newline-separated ids: whitespace-trimmed, empty lines dropped.
pub fn parse_list(list_bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(list_bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Decodes a subunit enumeration stream into the ordered ids that carry an
/// `exists` status. Interleaved non-subunit bytes are tolerated and ignored.
pub fn parse_enumeration(enumeration_bytes: &[u8]) -> Vec<String> {
    subunit::decode_all(enumeration_bytes)
        .into_iter()
        .filter(|event| event.status == Some(TestStatus::Exists))
        .filter_map(|event| event.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subunit::{encode_events, TestEvent};

    #[test]
    fn write_then_parse_roundtrips() {
        let ids = ["test_a", "test_b", "sub.module.test_c"];
        let mut sink = Vec::new();
        write_list(&mut sink, ids).unwrap();
        assert_eq!(sink, b"test_a\ntest_b\nsub.module.test_c\n");
        assert_eq!(parse_list(&sink), ids);
    }

    #[test]
    fn parse_list_trims_and_drops_blanks() {
        let parsed = parse_list(b"  test_a  \n\n\ttest_b\n   \n");
        assert_eq!(parsed, ["test_a", "test_b"]);
    }

    #[test]
    fn enumeration_keeps_only_exists_events() {
        let events = vec![
            TestEvent::new("listed_1", TestStatus::Exists),
            TestEvent::new("ran", TestStatus::Success),
            TestEvent::new("listed_2", TestStatus::Exists),
        ];
        let bytes = encode_events(&events).unwrap();
        assert_eq!(parse_enumeration(&bytes), ["listed_1", "listed_2"]);
    }

    #[test]
    fn enumeration_tolerates_interleaved_noise() {
        let mut bytes = b"compiling fixtures...\n".to_vec();
        bytes.extend(encode_events(&[TestEvent::new("only", TestStatus::Exists)]).unwrap());
        assert_eq!(parse_enumeration(&bytes), ["only"]);
    }

    #[test]
    fn empty_stream_is_empty_list() {
        assert!(parse_enumeration(b"").is_empty());
    }
}
