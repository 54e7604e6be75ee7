//! External Tool Interfaces Module
//!
//! Every delegated computation (similarity search, protein alignment,
//! tree inference) sits behind a capability trait so the orchestration
//! logic can be exercised with deterministic stand-ins in tests. The
//! production implementations invoke the real binaries as blocking
//! subprocesses, which is the pipeline's only suspension point.
//!
//! Failures map to `PipelineError::ExternalTool` carrying the tool name,
//! exit status, and captured stderr. No invocation is retried.

use anyhow::Result;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::PipelineError;

// ============================================================================
// Capability Traits
// ============================================================================

/// All-vs-all pairwise similarity search over a protein FASTA.
pub trait Searcher: Sync {
    /// Tool name used in error and progress messages.
    fn name(&self) -> &str;

    /// Searches `proteins` against itself, writing 14-column tabular hits
    /// (see `btab`) to `hits_out`.
    fn search(&self, proteins: &Path, hits_out: &Path, threads: usize) -> Result<()>;
}

/// Protein multiple-sequence alignment.
pub trait Aligner: Sync {
    fn name(&self) -> &str;

    /// Aligns the FASTA at `input` and writes aligned FASTA to `output`.
    fn align(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Maximum-likelihood tree inference from a nucleotide alignment.
pub trait TreeBuilder: Sync {
    fn name(&self) -> &str;

    /// Infers a tree with branch lengths from the alignment at `input`,
    /// writing Newick to `output`.
    fn build_tree(&self, input: &Path, output: &Path) -> Result<()>;
}

// ============================================================================
// Subprocess Helper
// ============================================================================

/// Runs a configured command, mapping failure to `ExternalTool`.
///
/// Captures stderr so diagnostics from the tool survive into the error;
/// stdout is returned for tools that write their result there.
fn run_tool(tool: &str, cmd: &mut Command) -> Result<Vec<u8>> {
    let output = cmd.output().map_err(|e| PipelineError::ExternalTool {
        tool: tool.to_string(),
        status: None,
        detail: format!("failed to spawn: {}", e),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PipelineError::ExternalTool {
            tool: tool.to_string(),
            status: output.status.code(),
            detail: stderr.trim().chars().take(500).collect(),
        }
        .into());
    }

    Ok(output.stdout)
}

// ============================================================================
// DIAMOND (similarity search)
// ============================================================================

/// DIAMOND blastp all-vs-all searcher.
///
/// Builds a database next to the hits file, then runs `blastp` with an
/// extended tabular output carrying query/subject lengths. `-k0` keeps
/// all hits; thresholding happens during graph construction.
pub struct Diamond {
    /// Path to the diamond executable.
    pub path: PathBuf,
    /// E-value ceiling passed through to the tool.
    pub max_evalue: f64,
}

impl Searcher for Diamond {
    fn name(&self) -> &str {
        "diamond"
    }

    fn search(&self, proteins: &Path, hits_out: &Path, threads: usize) -> Result<()> {
        let db_path = hits_out.with_extension("dmnd");

        run_tool(
            "diamond",
            Command::new(&self.path)
                .arg("makedb")
                .arg("--in")
                .arg(proteins)
                .arg("-d")
                .arg(&db_path)
                .args(["--threads", &threads.to_string()])
                .stdin(std::process::Stdio::null()),
        )?;

        run_tool(
            "diamond",
            Command::new(&self.path)
                .arg("blastp")
                .arg("-q")
                .arg(proteins)
                .arg("-d")
                .arg(&db_path)
                .arg("-o")
                .arg(hits_out)
                .args([
                    "--outfmt", "6", "qseqid", "sseqid", "pident", "length", "mismatch",
                    "gapopen", "qstart", "qend", "sstart", "send", "evalue", "bitscore",
                    "qlen", "slen",
                ])
                .args(["-k", "0"])
                .args(["-e", &format!("{}", self.max_evalue)])
                .args(["--threads", &threads.to_string()])
                .stdin(std::process::Stdio::null()),
        )?;

        Ok(())
    }
}

// ============================================================================
// MUSCLE (protein alignment)
// ============================================================================

/// MUSCLE v5 protein aligner (`muscle -align in -output out`).
pub struct Muscle {
    /// Path to the muscle executable.
    pub path: PathBuf,
}

impl Aligner for Muscle {
    fn name(&self) -> &str {
        "muscle"
    }

    fn align(&self, input: &Path, output: &Path) -> Result<()> {
        run_tool(
            "muscle",
            Command::new(&self.path)
                .arg("-align")
                .arg(input)
                .arg("-output")
                .arg(output)
                .stdin(std::process::Stdio::null()),
        )?;
        Ok(())
    }
}

// ============================================================================
// FastTree (tree inference)
// ============================================================================

/// FastTree nucleotide tree builder (`fasttree -nt -gtr`).
///
/// FastTree writes the tree to stdout; the captured output is persisted
/// to the requested path.
pub struct FastTree {
    /// Path to the fasttree executable.
    pub path: PathBuf,
}

impl TreeBuilder for FastTree {
    fn name(&self) -> &str {
        "fasttree"
    }

    fn build_tree(&self, input: &Path, output: &Path) -> Result<()> {
        let stdout = run_tool(
            "fasttree",
            Command::new(&self.path)
                .args(["-nt", "-gtr", "-quiet"])
                .arg(input)
                .stdin(std::process::Stdio::null()),
        )?;

        if stdout.is_empty() {
            return Err(PipelineError::ExternalTool {
                tool: "fasttree".to_string(),
                status: Some(0),
                detail: "produced no tree output".to_string(),
            }
            .into());
        }

        let mut file = File::create(output)?;
        file.write_all(&stdout)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_reports_external_tool() {
        let aligner = Muscle {
            path: PathBuf::from("/nonexistent/locusphy-muscle"),
        };
        let err = aligner
            .align(Path::new("/tmp/in.faa"), Path::new("/tmp/out.aln"))
            .unwrap_err();
        let perr = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(perr.reason_code(), "external_tool_failure");
    }
}
