//! Regrouping of a flat results log.
//!
//! A benchmark sweep that runs each configuration `n` times back to back in
//! round-robin order writes one line per run. Regrouping collects line `i`
//! into bucket `i % n` and emits the buckets in order, so the repeats of one
//! configuration end up adjacent. Lines are handled as raw bytes and written
//! back unchanged, terminators included.
//!
//! Only `\n` ends a line. A lone `\r` (old Mac line ending) stays inside the
//! line it appears in, unlike a text-mode reader with universal newlines.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::{Error, Result};

/// Reads every line of `reader` into `n_repeat` buckets by position.
pub fn group_lines<R: BufRead>(mut reader: R, n_repeat: usize) -> Result<Vec<Vec<Vec<u8>>>> {
    if n_repeat == 0 {
        return Err(Error::InvalidRepeat);
    }
    let mut groups = vec![Vec::new(); n_repeat];
    let mut index = 0;
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        groups[index % n_repeat].push(line);
        index += 1;
    }
    tracing::debug!(lines = index, groups = n_repeat, "grouped lines");
    Ok(groups)
}

pub fn write_groups<W: Write>(writer: &mut W, groups: &[Vec<Vec<u8>>]) -> Result<()> {
    for line in groups.iter().flatten() {
        writer.write_all(line)?;
    }
    writer.flush()?;
    Ok(())
}

/// Regroups the file at `path` into `writer`.
pub fn summarize_results<W: Write>(path: &Path, n_repeat: usize, writer: &mut W) -> Result<()> {
    let file = File::open(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let groups = group_lines(BufReader::new(file), n_repeat).map_err(|err| match err {
        Error::Stream(source) => Error::Io {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })?;
    write_groups(writer, &groups)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use proptest::prelude::*;

    use super::*;

    fn regroup(input: &str, n: usize) -> String {
        let groups = group_lines(Cursor::new(input), n).unwrap();
        let mut out = Vec::new();
        write_groups(&mut out, &groups).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn interleaved_runs_become_adjacent() {
        assert_eq!(regroup("a\nb\nc\nd\ne\nf\n", 2), "a\nc\ne\nb\nd\nf\n");
        assert_eq!(regroup("a\nb\nc\nd\ne\nf\n", 3), "a\nd\nb\ne\nc\nf\n");
    }

    #[test]
    fn single_group_is_identity() {
        let input = "x\ny\nz\n";
        assert_eq!(regroup(input, 1), input);
    }

    #[test]
    fn missing_final_newline_is_preserved() {
        // Concatenation is raw: the unterminated line runs into the next one.
        assert_eq!(regroup("a\nb\nc", 2), "a\ncb\n");
    }

    #[test]
    fn more_groups_than_lines() {
        assert_eq!(regroup("a\nb\n", 5), "a\nb\n");
        assert_eq!(regroup("", 5), "");
    }

    #[test]
    fn carriage_returns_pass_through() {
        assert_eq!(regroup("a\r\nb\r\nc\r\n", 2), "a\r\nc\r\nb\r\n");
    }

    #[test]
    fn lone_carriage_return_does_not_split() {
        assert_eq!(regroup("a\rb\nc\n", 2), "a\rb\nc\n");
        let groups = group_lines(Cursor::new("a\rb\rc\n"), 3).unwrap();
        assert_eq!(groups[0], vec![b"a\rb\rc\n".to_vec()]);
        assert!(groups[1].is_empty() && groups[2].is_empty());
    }

    #[test]
    fn zero_repeat_is_rejected() {
        assert!(matches!(
            group_lines(Cursor::new("a\n"), 0),
            Err(Error::InvalidRepeat)
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.txt");
        let mut out = Vec::new();
        match summarize_results(&path, 5, &mut out) {
            Err(Error::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected Io error, got {other:?}"),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"r1 a\nr1 b\nr2 a\nr2 b\n").unwrap();
        let mut out = Vec::new();
        summarize_results(file.path(), 2, &mut out).unwrap();
        assert_eq!(out, b"r1 a\nr2 a\nr1 b\nr2 b\n");
    }

    proptest! {
        #[test]
        fn line_lands_in_bucket_by_position(
            lines in prop::collection::vec("[a-z0-9 ]{0,8}", 0..40),
            n in 1usize..8,
        ) {
            let input: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let groups = group_lines(Cursor::new(input.as_bytes()), n).unwrap();
            prop_assert_eq!(groups.len(), n);
            for (i, line) in lines.iter().enumerate() {
                let expected = format!("{line}\n").into_bytes();
                prop_assert_eq!(&groups[i % n][i / n], &expected);
            }
        }

        #[test]
        fn output_is_a_permutation_of_input(
            lines in prop::collection::vec("[a-z]{1,4}", 0..30),
            n in 1usize..6,
        ) {
            let input: String = lines.iter().map(|l| format!("{l}\n")).collect();
            let output = regroup(&input, n);
            prop_assert_eq!(output.len(), input.len());
            let mut a: Vec<_> = input.lines().collect();
            let mut b: Vec<_> = output.lines().collect();
            a.sort_unstable();
            b.sort_unstable();
            prop_assert_eq!(a, b);
        }
    }
}
