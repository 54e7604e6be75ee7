//! Sequence I/O Module
//!
//! Provides unified reading and writing for FASTA sequence files,
//! including gzip-compressed input (auto-detected by extension).
//!
//! # Supported Formats
//! - FASTA: header line (`>name description`) followed by sequence lines
//! - FASTA.gz: same, gzip-compressed
//!
//! # Examples
//! ```no_run
//! use locusphy::seqio::FastaFile;
//!
//! let mut reader = FastaFile::open("proteins.faa.gz").unwrap();
//! while let Some(record) = reader.read_next().unwrap() {
//!     println!("{}: {} aa", record.name, record.seq.len());
//! }
//! ```

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

// ============================================================================
// FASTA Record
// ============================================================================

/// A FASTA record with its full header preserved.
///
/// # Fields
/// - `name`: identifier (text after '>' up to first whitespace)
/// - `desc`: remainder of the header line, if any
/// - `seq`: sequence (concatenated from all sequence lines)
#[derive(Debug, Clone)]
pub struct FastaRecord {
    /// Sequence identifier extracted from the header line.
    pub name: String,
    /// Header text after the identifier (coordinate comments live here).
    pub desc: Option<String>,
    /// Amino-acid or nucleotide sequence.
    pub seq: String,
}

// ============================================================================
// FASTA Reader
// ============================================================================

/// Generic FASTA reader over any `Read` source.
///
/// Use `FastaReader<File>` for plain files or
/// `FastaReader<MultiGzDecoder<File>>` for gzipped files;
/// `FastaFile` wraps both behind extension auto-detection.
pub struct FastaReader<R: Read> {
    reader: BufReader<R>,
    line_buf: String,
    current_header: Option<(String, Option<String>)>,
}

impl FastaReader<File> {
    /// Opens a plain (uncompressed) FASTA file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open FASTA: {}", path.as_ref().display()))?;
        Self::from_reader(file)
    }
}

impl FastaReader<MultiGzDecoder<File>> {
    /// Opens a gzip-compressed FASTA file.
    pub fn open_gz<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open FASTA.gz: {}", path.as_ref().display()))?;
        Self::from_reader(MultiGzDecoder::new(file))
    }
}

impl<R: Read> FastaReader<R> {
    fn from_reader(source: R) -> Result<Self> {
        let mut reader = Self {
            reader: BufReader::with_capacity(1024 * 1024, source),
            line_buf: String::with_capacity(256),
            current_header: None,
        };

        // Read first header line to initialise state
        reader.line_buf.clear();
        if reader.reader.read_line(&mut reader.line_buf)? > 0 {
            if !reader.line_buf.starts_with('>') {
                anyhow::bail!("Invalid FASTA: first line must start with '>'");
            }
            reader.current_header = Some(split_header(&reader.line_buf));
        }

        Ok(reader)
    }

    /// Reads the next FASTA record.
    ///
    /// # Returns
    /// - `Ok(Some(record))` - Successfully read a record
    /// - `Ok(None)` - End of file reached
    /// - `Err(e)` - I/O error occurred
    pub fn read_next(&mut self) -> Result<Option<FastaRecord>> {
        let (name, desc) = match self.current_header.take() {
            Some(h) => h,
            None => return Ok(None),
        };

        let mut seq = String::with_capacity(2048);

        loop {
            self.line_buf.clear();
            if self.reader.read_line(&mut self.line_buf)? == 0 {
                break;
            }

            if self.line_buf.starts_with('>') {
                // New record header encountered
                self.current_header = Some(split_header(&self.line_buf));
                break;
            } else {
                seq.push_str(self.line_buf.trim_end());
            }
        }

        Ok(Some(FastaRecord { name, desc, seq }))
    }
}

impl<R: Read> Iterator for FastaReader<R> {
    type Item = Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Splits a header line into (name, description).
fn split_header(line: &str) -> (String, Option<String>) {
    let header = line[1..].trim_end();
    match header.split_once(char::is_whitespace) {
        Some((name, rest)) => {
            let rest = rest.trim();
            let desc = if rest.is_empty() { None } else { Some(rest.to_string()) };
            (name.to_string(), desc)
        }
        None => (header.to_string(), None),
    }
}

// ============================================================================
// Auto-detecting FASTA File
// ============================================================================

/// Auto-detecting FASTA file reader.
///
/// Files ending in `.gz` are opened with gzip decompression,
/// everything else as plain text.
pub enum FastaFile {
    /// Plain text FASTA file.
    Plain(FastaReader<File>),
    /// Gzip-compressed FASTA file.
    Gzipped(FastaReader<MultiGzDecoder<File>>),
}

impl FastaFile {
    /// Opens a FASTA file with automatic compression detection.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        if ext == "gz" {
            Ok(FastaFile::Gzipped(FastaReader::open_gz(path)?))
        } else {
            Ok(FastaFile::Plain(FastaReader::open(path)?))
        }
    }

    /// Reads the next FASTA record, delegating to the underlying reader.
    pub fn read_next(&mut self) -> Result<Option<FastaRecord>> {
        match self {
            FastaFile::Plain(r) => r.read_next(),
            FastaFile::Gzipped(r) => r.read_next(),
        }
    }

    /// Reads all remaining records into memory.
    pub fn read_all(&mut self) -> Result<Vec<FastaRecord>> {
        let mut records = Vec::new();
        while let Some(record) = self.read_next()? {
            records.push(record);
        }
        Ok(records)
    }
}

// ============================================================================
// FASTA Writer
// ============================================================================

/// Writes (name, sequence) pairs as single-line FASTA records.
///
/// Single-line sequences keep downstream tool invocations simple; the
/// external aligners and tree builders accept either layout.
pub fn write_fasta<W: Write, S: AsRef<str>>(out: &mut W, records: &[(S, S)]) -> Result<()> {
    for (name, seq) in records {
        writeln!(out, ">{}", name.as_ref())?;
        writeln!(out, "{}", seq.as_ref())?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufWriter;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("locusphy_seqio_{}_{}", std::process::id(), tag))
    }

    #[test]
    fn test_fasta_roundtrip() {
        let path = temp_path("roundtrip.faa");
        {
            let mut w = BufWriter::new(File::create(&path).unwrap());
            write_fasta(&mut w, &[("g1|A", "MKV"), ("g1|B", "MLL")]).unwrap();
        }

        let mut reader = FastaFile::open(&path).unwrap();
        let records = reader.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "g1|A");
        assert_eq!(records[0].seq, "MKV");
        assert_eq!(records[1].name, "g1|B");
        assert!(records[1].desc.is_none());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_header_description_kept() {
        let path = temp_path("desc.faa");
        std::fs::write(&path, ">gene_1 # 138 # 1161 # 1 # ID=1_1\nMKVL\nAA\n").unwrap();

        let mut reader = FastaFile::open(&path).unwrap();
        let rec = reader.read_next().unwrap().unwrap();
        assert_eq!(rec.name, "gene_1");
        assert_eq!(rec.desc.as_deref(), Some("# 138 # 1161 # 1 # ID=1_1"));
        assert_eq!(rec.seq, "MKVLAA");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_gzipped_input() {
        let path = temp_path("gz.faa.gz");
        {
            let file = File::create(&path).unwrap();
            let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            enc.write_all(b">x\nATGC\n").unwrap();
            enc.finish().unwrap();
        }

        let mut reader = FastaFile::open(&path).unwrap();
        let rec = reader.read_next().unwrap().unwrap();
        assert_eq!(rec.name, "x");
        assert_eq!(rec.seq, "ATGC");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_rejects_headerless_file() {
        let path = temp_path("bad.faa");
        std::fs::write(&path, "ATGC\n").unwrap();
        assert!(FastaFile::open(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
