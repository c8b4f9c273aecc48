//! Compact core-id set strings.
//!
//! The arbitrator hands core sets to callers as strings like `"0-3,8"`:
//! comma-separated single ids and inclusive ranges, no whitespace. Parsing
//! sorts and deduplicates; formatting coalesces consecutive ids back into
//! ranges, so `parse(format(ids)) == ids` for any id set.

/// Malformed id-spec string, with the offending span marked.
#[derive(Debug, thiserror::Error)]
#[error("bad id spec at columns {start}..{end} of {spec:?}")]
pub struct IdSpecError {
    pub spec: String,
    pub start: usize,
    pub end: usize,
}

/// Parse `"0-2,5,9-11"` into a sorted, deduplicated id list.
pub fn parse_id_spec(spec: &str) -> Result<Vec<u32>, IdSpecError> {
    let mut out: Vec<u32> = Vec::new();
    let mut push = |id: u32| {
        if !out.contains(&id) {
            out.push(id);
        }
    };

    let mut col = 0usize;
    for item in spec.split(',') {
        let start = col;
        let end = start + item.len();
        col = end + 1; // account for the separator

        let err = || IdSpecError {
            spec: spec.to_string(),
            start,
            end,
        };

        if let Some((lo, hi)) = item.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| err())?;
            let hi: u32 = hi.parse().map_err(|_| err())?;
            if hi < lo {
                return Err(err());
            }
            for id in lo..=hi {
                push(id);
            }
        } else {
            push(item.parse().map_err(|_| err())?);
        }
    }

    out.sort_unstable();
    Ok(out)
}

/// Inverse of [`parse_id_spec`]: sort and coalesce consecutive ids.
pub fn format_id_spec(ids: &[u32]) -> String {
    let mut work = ids.to_vec();
    work.sort_unstable();
    work.dedup();

    let mut out = String::new();
    let mut run: Option<(u32, u32)> = None;
    let mut flush = |run: (u32, u32), out: &mut String| {
        if !out.is_empty() {
            out.push(',');
        }
        out.push_str(&run.0.to_string());
        if run.0 != run.1 {
            out.push('-');
            out.push_str(&run.1.to_string());
        }
    };

    for id in work {
        run = match run {
            None => Some((id, id)),
            Some((lo, hi)) if id == hi + 1 => Some((lo, id)),
            Some(done) => {
                flush(done, &mut out);
                Some((id, id))
            }
        };
    }
    if let Some(done) = run {
        flush(done, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lists_ranges_and_mixes() {
        assert_eq!(parse_id_spec("0,1,2").unwrap(), [0, 1, 2]);
        assert_eq!(parse_id_spec("9,8,5").unwrap(), [5, 8, 9]);
        assert_eq!(parse_id_spec("0-3").unwrap(), [0, 1, 2, 3]);
        assert_eq!(parse_id_spec("5-7,0-2").unwrap(), [0, 1, 2, 5, 6, 7]);
        assert_eq!(parse_id_spec("4,7-8,1-3").unwrap(), [1, 2, 3, 4, 7, 8]);
        assert_eq!(parse_id_spec("3,3,3").unwrap(), [3]);
    }

    #[test]
    fn rejects_garbage_with_position() {
        for bad in ["", "a", "1,,2", "3-", "-3", "5-2", "1-2-3", "1, 2"] {
            assert!(parse_id_spec(bad).is_err(), "accepted {bad:?}");
        }
        let err = parse_id_spec("0-2,x,5").unwrap_err();
        assert_eq!((err.start, err.end), (4, 5));
    }

    #[test]
    fn formats_with_coalesced_ranges() {
        assert_eq!(format_id_spec(&[0, 1, 2, 3, 8]), "0-3,8");
        assert_eq!(format_id_spec(&[5]), "5");
        assert_eq!(format_id_spec(&[]), "");
        assert_eq!(format_id_spec(&[2, 1, 1, 0, 9]), "0-2,9");
    }

    #[test]
    fn round_trips() {
        for ids in [
            vec![0u32],
            vec![0, 2, 4, 6],
            vec![10, 11, 12, 40, 41, 99],
            (0..64).collect::<Vec<_>>(),
            vec![4_294_967_000, 4_294_967_001],
        ] {
            let spec = format_id_spec(&ids);
            assert_eq!(parse_id_spec(&spec).unwrap(), ids, "spec {spec}");
        }
    }
}
