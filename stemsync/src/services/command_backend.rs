//! Model backend running an external separation runner
//!
//! The runner is any program speaking this command-line contract:
//!
//! ```text
//! <runner> [runner_args...] --check --model <id>
//!     exit 0 once the model is downloaded and loadable
//! <runner> [runner_args...] --model <id> --input <in.wav> --output <dir>
//!     writes <dir>/<stem>.wav for every stem of the model
//! ```
//!
//! Errors go to stderr; any stderr mentioning "out of memory" is reported as
//! an out-of-memory failure.

use crate::services::audio_codec::{self, PcmAudio};
use crate::services::separation_engine::{InferenceError, ModelBackend};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{Command, Output};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runner invocation settings
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RunnerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    fn run(&self, extra: &[&OsStr]) -> std::io::Result<Output> {
        let mut cmd = self.command();
        cmd.args(extra);
        debug!(program = %self.program, "Running separation runner");
        cmd.output()
    }
}

fn stderr_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("runner exited with {}", output.status)
    } else {
        stderr
    }
}

/// Backend bound to one model id
pub struct CommandBackend {
    runner: RunnerCommand,
    model_id: &'static str,
    scratch_root: PathBuf,
}

impl CommandBackend {
    /// Verify the runner can load `model_id`, then build the backend
    ///
    /// This is the slow step (weights download/load) and runs once per mode.
    pub fn load(
        runner: RunnerCommand,
        model_id: &'static str,
        scratch_root: PathBuf,
    ) -> Result<Self, String> {
        info!(model = model_id, program = %runner.program, "Loading separation model");

        let output = runner
            .run(&[OsStr::new("--check"), OsStr::new("--model"), OsStr::new(model_id)])
            .map_err(|e| format!("Failed to start '{}': {}", runner.program, e))?;

        if !output.status.success() {
            return Err(format!(
                "Model '{}' failed to load: {}",
                model_id,
                stderr_text(&output)
            ));
        }

        std::fs::create_dir_all(&scratch_root)
            .map_err(|e| format!("Failed to create {}: {}", scratch_root.display(), e))?;

        info!(model = model_id, "Separation model ready");
        Ok(Self {
            runner,
            model_id,
            scratch_root,
        })
    }

    fn run_inference(
        &self,
        work_dir: &std::path::Path,
        audio: &PcmAudio,
        stems: &[&str],
    ) -> Result<Vec<(String, PcmAudio)>, InferenceError> {
        let input = work_dir.join("input.wav");
        let output_dir = work_dir.join("stems");
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| InferenceError::Failed(format!("Failed to create work dir: {}", e)))?;

        audio_codec::write_wav(&input, audio)
            .map_err(|e| InferenceError::Failed(format!("Failed to write model input: {:#}", e)))?;

        let output = self
            .runner
            .run(&[
                OsStr::new("--model"),
                OsStr::new(self.model_id),
                OsStr::new("--input"),
                input.as_os_str(),
                OsStr::new("--output"),
                output_dir.as_os_str(),
            ])
            .map_err(|e| InferenceError::Failed(format!("Failed to start runner: {}", e)))?;

        if !output.status.success() {
            return Err(InferenceError::from_message(stderr_text(&output)));
        }

        stems
            .iter()
            .map(|&stem| {
                let path = output_dir.join(format!("{}.wav", stem));
                audio_codec::decode_file(&path)
                    .map(|pcm| (stem.to_string(), pcm))
                    .map_err(|e| {
                        InferenceError::Failed(format!("Runner output for '{}' unreadable: {:#}", stem, e))
                    })
            })
            .collect()
    }
}

impl ModelBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn infer(
        &self,
        audio: &PcmAudio,
        stems: &[&str],
    ) -> Result<Vec<(String, PcmAudio)>, InferenceError> {
        let work_dir = self.scratch_root.join(Uuid::new_v4().to_string());
        let result = self.run_inference(&work_dir, audio, stems);

        if let Err(e) = std::fs::remove_dir_all(&work_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove runner work dir {}: {}", work_dir.display(), e);
            }
        }
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> RunnerCommand {
        let path = dir.path().join("runner.sh");
        std::fs::write(&path, format!("{}\n", body)).unwrap();
        RunnerCommand::new("/bin/sh", vec![path.to_string_lossy().into_owned()])
    }

    #[test]
    fn test_load_fails_when_check_fails() {
        let dir = TempDir::new().unwrap();
        let runner = script(&dir, "echo 'no weights' >&2; exit 3");
        let err = CommandBackend::load(runner, "htdemucs", dir.path().join("scratch"))
            .err()
            .unwrap();
        assert!(err.contains("no weights"), "{}", err);
    }

    #[test]
    fn test_load_fails_for_missing_program() {
        let dir = TempDir::new().unwrap();
        let runner = RunnerCommand::new("/nonexistent/stem-runner", Vec::new());
        assert!(CommandBackend::load(runner, "htdemucs", dir.path().join("scratch")).is_err());
    }

    #[test]
    fn test_out_of_memory_stderr_classified() {
        let dir = TempDir::new().unwrap();
        let runner = script(
            &dir,
            r#"case "$1" in --check) exit 0;; esac
echo 'RuntimeError: CUDA out of memory' >&2
exit 1"#,
        );
        let backend = CommandBackend::load(runner, "htdemucs", dir.path().join("scratch")).unwrap();
        let audio = PcmAudio::new(vec![0.0; 200], 44100, 2);

        let err = backend.infer(&audio, &["drums"]).unwrap_err();
        assert!(matches!(err, InferenceError::OutOfMemory(_)));
        // Work dir removed on failure
        assert_eq!(std::fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
    }

    #[test]
    fn test_runner_output_read_back() {
        let dir = TempDir::new().unwrap();
        // Copies the input to every requested stem file
        let runner = script(
            &dir,
            r#"case "$1" in --check) exit 0;; esac
while [ $# -gt 0 ]; do
  case "$1" in
    --input) IN="$2"; shift 2;;
    --output) OUT="$2"; shift 2;;
    *) shift;;
  esac
done
for s in drums bass other vocals; do cp "$IN" "$OUT/$s.wav"; done"#,
        );
        let backend = CommandBackend::load(runner, "htdemucs", dir.path().join("scratch")).unwrap();
        let audio = PcmAudio::new(vec![0.25; 400], 44100, 2);

        let stems = backend
            .infer(&audio, &["drums", "bass", "other", "vocals"])
            .unwrap();
        assert_eq!(stems.len(), 4);
        assert_eq!(stems[3].0, "vocals");
        assert_eq!(stems[0].1.frames(), 200);
    }
}
