//! External OCR process orchestration.
//!
//! The extraction engine is an opaque script invoked per card:
//! `<interpreter> <script> <imagePath> <auxResourcePaths...>`. It prints a
//! single JSON document on stdout and diagnostics on stderr; a non-zero exit
//! code means the card could not be read. Retry policy belongs to the worker
//! loop, not here.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::models::ocr::OcrResult;

pub struct CardProcessor {
    interpreter: PathBuf,
    script: PathBuf,
    resources: Vec<PathBuf>,
    timeout: Duration,
}

impl CardProcessor {
    pub fn new(
        interpreter: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        resources: Vec<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            resources,
            timeout,
        }
    }

    /// Run the OCR script against one image and parse its stdout.
    ///
    /// Both output streams are drained to completion before the exit status
    /// is inspected, and stdout is only handed to the JSON parser after a
    /// clean exit. On timeout the subprocess is killed and a
    /// timeout-specific error is returned.
    pub async fn run(&self, image_path: &Path) -> Result<OcrResult, ProcessorError> {
        let mut command = Command::new(&self.interpreter);
        command
            .arg(&self.script)
            .arg(image_path)
            .args(&self.resources)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            interpreter = %self.interpreter.display(),
            script = %self.script.display(),
            image = %image_path.display(),
            "spawning OCR process"
        );

        let child = command.spawn().map_err(ProcessorError::Launch)?;

        // wait_with_output drains stdout and stderr concurrently, so the
        // child cannot deadlock on a full pipe. Dropping the future on
        // timeout kills the process via kill_on_drop.
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProcessorError::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(ProcessorError::Launch)?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(stderr = %stderr.trim(), "OCR process stderr");
        }

        if !output.status.success() {
            return Err(ProcessorError::Exit {
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(ProcessorError::Parse)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("failed to start OCR process: {0}")]
    Launch(#[from] std::io::Error),

    #[error("OCR process exited with code {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("OCR process timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("failed to parse OCR output as JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ProcessorError {
    /// Short tag stored in the job's error summary.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorError::Launch(_) => "process_launch",
            ProcessorError::Exit { .. } => "process_exit",
            ProcessorError::Timeout { .. } => "process_timeout",
            ProcessorError::Parse(_) => "output_parse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Write a shell script into the temp dir and return a processor that
    /// runs it via /bin/sh. The image path is passed as $1, resources after.
    fn sh_processor(dir: &tempfile::TempDir, body: &str, timeout_secs: u64) -> CardProcessor {
        let script = dir.path().join("fake_ocr.sh");
        let mut f = std::fs::File::create(&script).unwrap();
        writeln!(f, "{body}").unwrap();
        CardProcessor::new(
            "/bin/sh",
            script,
            Vec::new(),
            Duration::from_secs(timeout_secs),
        )
    }

    #[tokio::test]
    async fn clean_exit_parses_stdout_json() {
        let dir = tempfile::tempdir().unwrap();
        let processor = sh_processor(
            &dir,
            r#"echo '{"data":{"patient_info":{"mrn":"12-345","name":"DOE, JANE"},"phenotype":{"abo":"O"}}}'"#,
            5,
        );

        let result = processor.run(Path::new("/tmp/card.png")).await.unwrap();
        assert_eq!(result.data.patient_info.mrn.as_deref(), Some("12-345"));
        assert!(result.data.extra.contains_key("phenotype"));
        assert!(result.data.patient_info.extra.contains_key("name"));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let processor = sh_processor(&dir, r#"echo "decode error" >&2; exit 1"#, 5);

        let err = processor.run(Path::new("/tmp/card.png")).await.unwrap_err();
        match err {
            ProcessorError::Exit { code, stderr } => {
                assert_eq!(code, Some(1));
                assert!(stderr.contains("decode error"));
            }
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let processor = sh_processor(&dir, r#"echo "this is not json""#, 5);

        let err = processor.run(Path::new("/tmp/card.png")).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Parse(_)));
        assert_eq!(err.kind(), "output_parse");
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_launch_error() {
        let processor = CardProcessor::new(
            "/nonexistent/python",
            "/nonexistent/script.py",
            Vec::new(),
            Duration::from_secs(5),
        );

        let err = processor.run(Path::new("/tmp/card.png")).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Launch(_)));
    }

    #[tokio::test]
    async fn slow_process_hits_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let processor = sh_processor(&dir, "sleep 30", 1);

        let err = processor.run(Path::new("/tmp/card.png")).await.unwrap_err();
        match err {
            ProcessorError::Timeout { seconds } => assert_eq!(seconds, 1),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_and_resources_are_passed_positionally() {
        let dir = tempfile::tempdir().unwrap();
        // Echo the arguments back as JSON so we can assert the call shape.
        let processor = CardProcessor::new(
            "/bin/sh",
            {
                let script = dir.path().join("args.sh");
                std::fs::write(
                    &script,
                    r#"printf '{"data":{"patient_info":{"mrn":"1"},"args":["%s","%s","%s"]}}' "$1" "$2" "$3""#,
                )
                .unwrap();
                script
            },
            vec![PathBuf::from("/res/mask.png"), PathBuf::from("/res/coords.json")],
            Duration::from_secs(5),
        );

        let result = processor.run(Path::new("/tmp/card.png")).await.unwrap();
        let args = result.data.extra.get("args").unwrap();
        assert_eq!(args[0], "/tmp/card.png");
        assert_eq!(args[1], "/res/mask.png");
        assert_eq!(args[2], "/res/coords.json");
    }
}
