use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{debug, info};

use crate::config::{QuantToolSettings, ResolvedConfig};
use crate::domain::{JobKind, ResultFileKind};
use crate::error::KiraError;
use crate::fs_util;
use crate::pipeline::{ContextCore, JobContext, Pipeline, Stage};
use crate::records::{Job, RecordStore, ResultFile, Sample};

pub const QUANT_FILE: &str = "quant.sf";
const STDERR_EXCERPT_LEN: usize = 200;

/// Runs a quantification tool over a sample's reads.
pub trait QuantTool: Send + Sync {
    fn quantify(
        &self,
        settings: &QuantToolSettings,
        inputs: &[Utf8PathBuf],
        output_dir: &Utf8Path,
    ) -> Result<(), KiraError>;
}

#[derive(Debug, Clone, Default)]
pub struct SystemQuantTool;

impl SystemQuantTool {
    pub fn new() -> Self {
        Self
    }

    fn run_cmd(program: &Path, tool: &str, args: &[String]) -> Result<(), KiraError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| KiraError::ToolFailed {
                tool: tool.to_string(),
                message: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = stderr_excerpt(&stderr);
        Err(KiraError::ToolFailed {
            tool: tool.to_string(),
            message: if message.is_empty() {
                format!("exit status {}", output.status)
            } else {
                message
            },
        })
    }
}

impl QuantTool for SystemQuantTool {
    fn quantify(
        &self,
        settings: &QuantToolSettings,
        inputs: &[Utf8PathBuf],
        output_dir: &Utf8Path,
    ) -> Result<(), KiraError> {
        let program = find_in_path(&settings.program)
            .ok_or_else(|| KiraError::MissingTool(settings.program.clone()))?;
        let args = expand_args(settings, inputs, output_dir)?;
        debug!(program = %program.display(), ?args, "running quantification tool");
        Self::run_cmd(&program, &settings.program, &args)
    }
}

/// Substitutes `{index}`, `{output_dir}` and `{input}`; `{input}` expands to
/// one argument per input file.
pub fn expand_args(
    settings: &QuantToolSettings,
    inputs: &[Utf8PathBuf],
    output_dir: &Utf8Path,
) -> Result<Vec<String>, KiraError> {
    let mut args = Vec::with_capacity(settings.args.len() + inputs.len());
    for arg in &settings.args {
        match arg.as_str() {
            "{input}" => args.extend(inputs.iter().map(|input| input.to_string())),
            "{index}" => {
                let index = settings.index.as_ref().ok_or_else(|| {
                    KiraError::ConfigParse("quant_tool.index is required".to_string())
                })?;
                args.push(index.clone());
            }
            "{output_dir}" => args.push(output_dir.to_string()),
            other => args.push(other.to_string()),
        }
    }
    Ok(args)
}

/// The tool's own error message when it printed one, clipped.
pub fn stderr_excerpt(stderr: &str) -> String {
    let start = stderr.find("Error:").unwrap_or(0);
    stderr[start..].trim().chars().take(STDERR_EXCERPT_LEN).collect()
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.exists().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

pub struct ProcessContext {
    core: ContextCore,
    pub sample: Sample,
    pub inputs: Vec<Utf8PathBuf>,
    pub output_dir: Utf8PathBuf,
    pub registered: Vec<ResultFile>,
}

impl ProcessContext {
    pub fn quant_file(&self) -> Utf8PathBuf {
        self.output_dir.join(QUANT_FILE)
    }
}

impl JobContext for ProcessContext {
    fn core(&self) -> &ContextCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ContextCore {
        &mut self.core
    }

    fn output_location(&self) -> Option<String> {
        self.registered
            .iter()
            .find(|file| file.kind == ResultFileKind::Smashable)
            .map(|file| file.path.clone())
    }
}

pub struct ProcessPipeline<'a, S: RecordStore, T: QuantTool + ?Sized> {
    store: &'a S,
    config: &'a ResolvedConfig,
    tool: &'a T,
}

impl<'a, S: RecordStore, T: QuantTool + ?Sized> ProcessPipeline<'a, S, T> {
    pub fn new(store: &'a S, config: &'a ResolvedConfig, tool: &'a T) -> Self {
        Self {
            store,
            config,
            tool,
        }
    }

    fn prepare_files(&self, context: &mut ProcessContext) -> Result<(), KiraError> {
        for id in context.core.job.original_files.clone() {
            let file = self.store.original_file(id)?;
            let local = file
                .local_path
                .as_deref()
                .filter(|path| file.is_downloaded && Utf8Path::new(path).exists());
            match local {
                Some(path) => context.inputs.push(Utf8PathBuf::from(path)),
                None => {
                    context
                        .core
                        .fail(format!("Original file {id} has not been downloaded"));
                    return Ok(());
                }
            }
        }
        if context.inputs.is_empty() {
            context.core.fail("No files were found for this processor job");
            return Ok(());
        }
        fs::create_dir_all(&context.output_dir)
            .map_err(|err| KiraError::Filesystem(format!("{}: {err}", context.output_dir)))
    }

    fn run_quant(&self, context: &mut ProcessContext) -> Result<(), KiraError> {
        let quant_file = context.quant_file();
        if self.config.skip_processed && quant_file.exists() {
            info!(job_id = %context.core.job_id(), path = %quant_file, "quantification already done, skipping");
            return Ok(());
        }
        self.tool
            .quantify(&self.config.quant_tool, &context.inputs, &context.output_dir)?;
        if !quant_file.exists() {
            context
                .core
                .fail(format!("{} did not produce {QUANT_FILE}", self.config.quant_tool.program));
        }
        Ok(())
    }

    fn register_results(&self, context: &mut ProcessContext) -> Result<(), KiraError> {
        let accession = context.sample.accession_code.clone();
        let quant_file = context.quant_file();
        let quant = self.register(context, &quant_file, ResultFileKind::QuantSf)?;

        let table_path = context.output_dir.join(format!("{accession}_quant.tsv"));
        write_tpm_table(&quant_file, &table_path)?;
        let table = self.register(context, &table_path, ResultFileKind::Smashable)?;
        info!(
            sample = %accession,
            quant_id = quant.id,
            table_id = table.id,
            "registered quantification results"
        );
        Ok(())
    }

    fn register(
        &self,
        context: &mut ProcessContext,
        path: &Utf8Path,
        kind: ResultFileKind,
    ) -> Result<ResultFile, KiraError> {
        let (sha256, size_in_bytes) = fs_util::sha256_file(path)?;
        let file = self.store.add_result_file(ResultFile {
            id: 0,
            samples: vec![context.sample.accession_code.clone()],
            filename: path.file_name().unwrap_or_default().to_string(),
            path: path.to_string(),
            sha256: Some(sha256),
            size_in_bytes,
            created_at: Utc::now(),
            kind,
            organism: Some(context.sample.organism.clone()),
        })?;
        context.registered.push(file.clone());
        Ok(file)
    }
}

/// Reduces a `quant.sf` table to its `Name` and `TPM` columns.
pub fn write_tpm_table(quant_file: &Utf8Path, destination: &Utf8Path) -> Result<(), KiraError> {
    let invalid = |message: String| KiraError::InvalidFrame {
        path: quant_file.to_string(),
        message,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .from_path(quant_file)
        .map_err(|err| invalid(err.to_string()))?;
    let headers = reader.headers().map_err(|err| invalid(err.to_string()))?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|header| header == name)
            .ok_or_else(|| invalid(format!("missing {name} column")))
    };
    let (name_at, tpm_at) = (column("Name")?, column("TPM")?);

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(destination)
        .map_err(|err| KiraError::Filesystem(format!("{destination}: {err}")))?;
    writer
        .write_record(["Name", "TPM"])
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    for record in reader.records() {
        let record = record.map_err(|err| invalid(err.to_string()))?;
        let (Some(name), Some(tpm)) = (record.get(name_at), record.get(tpm_at)) else {
            continue;
        };
        writer
            .write_record([name, tpm])
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| KiraError::Filesystem(err.to_string()))
}

impl<'a, S: RecordStore, T: QuantTool + ?Sized> Pipeline for ProcessPipeline<'a, S, T> {
    type Context = ProcessContext;

    fn kind(&self) -> JobKind {
        JobKind::Process
    }

    fn prepare(&self, job: Job) -> Result<ProcessContext, KiraError> {
        let accession = job
            .sample
            .clone()
            .ok_or_else(|| KiraError::SampleNotFound(format!("job {} has no sample", job.id)))?;
        let sample = self.store.sample(&accession)?;
        let output_dir = self.config.processed_root().join(job.id.to_string());
        Ok(ProcessContext {
            core: ContextCore::new(job),
            sample,
            inputs: Vec::new(),
            output_dir,
            registered: Vec::new(),
        })
    }

    fn stages(&self) -> Vec<Stage<Self>> {
        vec![
            Stage::new("prepare_files", Self::prepare_files),
            Stage::new("run_quant", Self::run_quant),
            Stage::new("register_results", Self::register_results),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_starts_at_error_marker() {
        let stderr = format!("progress...\nError: index missing {}", "x".repeat(300));
        let excerpt = stderr_excerpt(&stderr);
        assert!(excerpt.starts_with("Error: index missing"));
        assert_eq!(excerpt.chars().count(), 200);
        assert_eq!(stderr_excerpt("  boom \n"), "boom");
    }

    #[test]
    fn input_placeholder_expands_per_file() {
        let settings = QuantToolSettings {
            program: "salmon".into(),
            args: vec!["-i".into(), "{index}".into(), "-r".into(), "{input}".into(), "-o".into(), "{output_dir}".into()],
            index: Some("/idx".into()),
        };
        let inputs = vec![Utf8PathBuf::from("a.fq"), Utf8PathBuf::from("b.fq")];
        let args = expand_args(&settings, &inputs, Utf8Path::new("/out")).unwrap();
        assert_eq!(args, ["-i", "/idx", "-r", "a.fq", "b.fq", "-o", "/out"]);
    }
}
