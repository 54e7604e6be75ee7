//! Pipeline Error Taxonomy
//!
//! Classifies failures into the four categories the pipeline distinguishes
//! when deciding whether to abort the run or to exclude a single homolog
//! group and continue:
//!
//! - `InputFormat`: malformed genome/gene input; fatal, raised before any
//!   external tool is invoked
//! - `ExternalTool`: a delegated tool exited abnormally or produced
//!   unparsable output; fatal for single-invocation stages (similarity
//!   search, consensus), isolated per group otherwise
//! - `InsufficientData`: too few genomes/leaves for a meaningful tree or
//!   congruence score; never fatal, recorded as an exclusion
//! - `Consistency`: codon/protein length mismatch or a leaf-set mismatch
//!   between a gene tree and the consensus; per-group failure, never
//!   silently coerced

use thiserror::Error;

/// Errors raised by pipeline stages.
///
/// Fatal stages propagate these through `anyhow::Error`; the per-group
/// phase catches them, records an exclusion reason, and continues.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed input: missing sequence files, bad FASTA, inconsistent
    /// protein/nucleotide pairing, unparsable annotation rows.
    #[error("input format error: {0}")]
    InputFormat(String),

    /// An external tool exited non-zero or could not be executed.
    #[error("external tool failure: {tool} (exit status {status:?}): {detail}")]
    ExternalTool {
        /// Tool name as invoked (e.g. "diamond", "muscle", "fasttree").
        tool: String,
        /// Exit status code if the process ran at all.
        status: Option<i32>,
        /// Captured stderr or a spawn error description.
        detail: String,
    },

    /// Not enough genomes or leaves to compute the requested result.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Data that should agree does not (codon/protein lengths, leaf sets).
    #[error("consistency error: {0}")]
    Consistency(String),
}

impl PipelineError {
    /// Short machine-readable code used in the exclusion column of the
    /// congruence report.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PipelineError::InputFormat(_) => "input_format",
            PipelineError::ExternalTool { .. } => "external_tool_failure",
            PipelineError::InsufficientData(_) => "insufficient_data",
            PipelineError::Consistency(_) => "consistency_error",
        }
    }
}
