//! BLAST Tabular Hit Parser Module
//!
//! Parses tabular output from the pairwise similarity search tool
//! (DIAMOND blastp, BLAST `-outfmt 6` compatible) extended with query and
//! subject lengths.
//!
//! # Column Layout (14 tab-separated columns)
//! ```text
//! Col  Type    Description
//! 1    string  Query sequence name
//! 2    string  Subject sequence name
//! 3    float   Percent identity
//! 4    int     Alignment length
//! 5    int     Mismatches
//! 6    int     Gap openings
//! 7    int     Query start (1-based)
//! 8    int     Query end
//! 9    int     Subject start
//! 10   int     Subject end
//! 11   float   E-value
//! 12   float   Bit score
//! 13   int     Query sequence length
//! 14   int     Subject sequence length
//! ```
//!
//! # Example Usage
//! ```no_run
//! use locusphy::btab::BtabReader;
//!
//! let mut reader = BtabReader::open("hits.tsv").unwrap();
//! while let Some(hit) = reader.read_next().unwrap() {
//!     println!("{} -> {} ({:.1}% identity)", hit.query, hit.subject, hit.identity);
//! }
//! ```

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

// ============================================================================
// Hit Record
// ============================================================================

/// A single tabular similarity hit.
#[derive(Debug, Clone)]
pub struct BtabHit {
    /// Query sequence name (column 1).
    pub query: String,
    /// Subject sequence name (column 2).
    pub subject: String,
    /// Percent identity over the alignment (column 3).
    pub identity: f64,
    /// Alignment length in residues (column 4).
    pub aln_len: usize,
    /// Query start position, 1-based (column 7).
    pub query_start: usize,
    /// Query end position (column 8).
    pub query_end: usize,
    /// Subject start position (column 9).
    pub subject_start: usize,
    /// Subject end position (column 10).
    pub subject_end: usize,
    /// Expectation value (column 11).
    pub evalue: f64,
    /// Bit score (column 12).
    pub bitscore: f64,
    /// Full query length (column 13).
    pub query_len: usize,
    /// Full subject length (column 14).
    pub subject_len: usize,
}

impl BtabHit {
    /// Parses a hit from a tab-separated line.
    ///
    /// # Errors
    /// Returns an error if the line has fewer than 14 fields or any
    /// numeric field fails to parse.
    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 14 {
            anyhow::bail!("Invalid hit line: fewer than 14 fields");
        }

        Ok(Self {
            query: fields[0].to_string(),
            subject: fields[1].to_string(),
            identity: fields[2].parse().context("Invalid identity")?,
            aln_len: fields[3].parse().context("Invalid alignment length")?,
            query_start: fields[6].parse().context("Invalid query start")?,
            query_end: fields[7].parse().context("Invalid query end")?,
            subject_start: fields[8].parse().context("Invalid subject start")?,
            subject_end: fields[9].parse().context("Invalid subject end")?,
            evalue: fields[10].parse().context("Invalid e-value")?,
            bitscore: fields[11].parse().context("Invalid bit score")?,
            query_len: fields[12].parse().context("Invalid query length")?,
            subject_len: fields[13].parse().context("Invalid subject length")?,
        })
    }

    /// Fraction of the query covered by the alignment (0-1).
    pub fn query_coverage(&self) -> f64 {
        if self.query_len == 0 {
            return 0.0;
        }
        (self.query_end.saturating_sub(self.query_start) + 1) as f64 / self.query_len as f64
    }

    /// Fraction of the subject covered by the alignment (0-1).
    pub fn subject_coverage(&self) -> f64 {
        if self.subject_len == 0 {
            return 0.0;
        }
        (self.subject_end.saturating_sub(self.subject_start) + 1) as f64 / self.subject_len as f64
    }

    /// Conservative pairwise coverage: the smaller of query and subject
    /// coverage. This is the value thresholded during graph building.
    pub fn mutual_coverage(&self) -> f64 {
        self.query_coverage().min(self.subject_coverage())
    }
}

// ============================================================================
// Hit Reader
// ============================================================================

/// Sequential reader for tabular hit files.
///
/// Skips empty lines; implements Iterator for use in for loops.
pub struct BtabReader {
    reader: BufReader<File>,
    line_buf: String,
}

impl BtabReader {
    /// Opens a tabular hit file for reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open hits file: {}", path.as_ref().display()))?;
        Ok(Self {
            reader: BufReader::with_capacity(1024 * 1024, file),
            line_buf: String::with_capacity(512),
        })
    }

    /// Reads the next hit record.
    ///
    /// # Returns
    /// - `Ok(Some(hit))` - Successfully read a record
    /// - `Ok(None)` - End of file reached
    /// - `Err(e)` - I/O or parsing error
    pub fn read_next(&mut self) -> Result<Option<BtabHit>> {
        loop {
            self.line_buf.clear();
            if self.reader.read_line(&mut self.line_buf)? == 0 {
                return Ok(None);
            }

            let line = self.line_buf.trim_end();
            if line.is_empty() {
                continue;
            }

            return Ok(Some(BtabHit::parse_line(line)?));
        }
    }
}

impl Iterator for BtabReader {
    type Item = Result<BtabHit>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(hit)) => Some(Ok(hit)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "gA|g1\tgB|g1\t92.5\t200\t15\t0\t1\t200\t1\t200\t1e-50\t350.1\t210\t205";

    #[test]
    fn test_parse_hit_line() {
        let hit = BtabHit::parse_line(LINE).unwrap();
        assert_eq!(hit.query, "gA|g1");
        assert_eq!(hit.subject, "gB|g1");
        assert_eq!(hit.identity, 92.5);
        assert_eq!(hit.aln_len, 200);
        assert_eq!(hit.evalue, 1e-50);
        assert_eq!(hit.bitscore, 350.1);
        assert_eq!(hit.query_len, 210);
        assert_eq!(hit.subject_len, 205);
    }

    #[test]
    fn test_coverage() {
        let hit = BtabHit::parse_line(LINE).unwrap();
        assert!((hit.query_coverage() - 200.0 / 210.0).abs() < 1e-9);
        assert!((hit.subject_coverage() - 200.0 / 205.0).abs() < 1e-9);
        assert_eq!(hit.mutual_coverage(), hit.query_coverage());
    }

    #[test]
    fn test_invalid_line() {
        assert!(BtabHit::parse_line("too\tshort").is_err());
        let bad = LINE.replace("92.5", "abc");
        assert!(BtabHit::parse_line(&bad).is_err());
    }
}
