use crate::app::ports::ObjectDetector;
use crate::error::{IngestError, Result};
use crate::types::Detection;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Object detector run as an external program.
///
/// The program is invoked as `<program> <args...> <image>` and must print a JSON
/// array of `{"label": ..., "confidence": ...}` objects on stdout. A run that
/// outlives the timeout is killed.
pub struct CommandDetector {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandDetector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(IngestError::Detector(format!(
                    "{} timed out after {:?}",
                    self.program, self.timeout
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Drain a child pipe on its own thread so a chatty detector cannot block on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

impl ObjectDetector for CommandDetector {
    fn detect(&self, image: &Path) -> Result<Vec<Detection>> {
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .arg(image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IngestError::Detector(format!(
                    "detector program {} not found",
                    self.program
                )))
            }
            Err(e) => return Err(IngestError::Io(e)),
        };

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = self.wait(&mut child)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if status.success() {
            parse_detections(&stdout)
        } else {
            Err(IngestError::Detector(format!(
                "{} exited with {}: {}",
                self.program,
                status,
                String::from_utf8_lossy(&stderr).trim()
            )))
        }
    }
}

fn parse_detections(stdout: &[u8]) -> Result<Vec<Detection>> {
    serde_json::from_slice(stdout)
        .map_err(|e| IngestError::Detector(format!("detector output is not a detection list: {e}")))
}
