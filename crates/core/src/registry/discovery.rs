//! Scans the processors directory and verifies each candidate.

use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::descriptor::{ProcessorDescriptor, DESCRIPTOR_FILE_NAME};
use super::error::{DescriptorError, DiscoveryError};
use crate::shell::shell_command;

/// Discovers every valid processor below `root`.
///
/// Results are sorted by directory name. Broken processors are logged and
/// left out; only an unreadable `root` fails the call.
pub async fn discover(
    root: &Path,
    self_test_timeout: Duration,
) -> Result<Vec<ProcessorDescriptor>, DiscoveryError> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|source| DiscoveryError::RootUnreadable {
            path: root.to_path_buf(),
            source,
        })?;

    let mut candidates: Vec<PathBuf> = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => candidates.push(entry.path()),
            Ok(None) => break,
            Err(source) => {
                return Err(DiscoveryError::RootUnreadable {
                    path: root.to_path_buf(),
                    source,
                })
            }
        }
    }
    candidates.sort();

    let results = join_all(
        candidates
            .iter()
            .map(|dir| load_processor(dir, self_test_timeout)),
    )
    .await;

    let mut processors = Vec::new();
    for (dir, result) in candidates.iter().zip(results) {
        match result {
            Ok(Some(descriptor)) => {
                info!(
                    processor = descriptor.name(),
                    consumes = ?descriptor.consumes(),
                    "Registered result processor"
                );
                processors.push(descriptor);
            }
            Ok(None) => debug!(path = %dir.display(), "Skipping entry without a descriptor"),
            Err(DescriptorError::SelfTestFailed {
                name,
                exit_code,
                stderr,
            }) => warn!(
                processor = %name,
                exit_code = ?exit_code,
                stderr = %stderr.trim(),
                "Processor failed its self test, skipping"
            ),
            Err(e) => warn!(path = %dir.display(), "Skipping processor: {}", e),
        }
    }

    Ok(processors)
}

/// `Ok(None)` for entries that are not processor directories.
async fn load_processor(
    dir: &Path,
    self_test_timeout: Duration,
) -> Result<Option<ProcessorDescriptor>, DescriptorError> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => {}
        _ => return Ok(None),
    }

    let descriptor_path = dir.join(DESCRIPTOR_FILE_NAME);
    if !tokio::fs::try_exists(&descriptor_path).await.unwrap_or(false) {
        return Ok(None);
    }

    let bytes = tokio::fs::read(&descriptor_path)
        .await
        .map_err(|source| DescriptorError::Unreadable {
            path: descriptor_path.clone(),
            source,
        })?;

    let descriptor = ProcessorDescriptor::parse(dir, &descriptor_path, &bytes)?;
    self_test(&descriptor, self_test_timeout).await?;
    Ok(Some(descriptor))
}

/// Runs the command once with no input and no `P_*` variables.
pub async fn self_test(
    descriptor: &ProcessorDescriptor,
    limit: Duration,
) -> Result<(), DescriptorError> {
    let mut cmd = shell_command(descriptor.command(), descriptor.working_directory());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = match timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(DescriptorError::SelfTestSpawn {
                name: descriptor.name().to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(DescriptorError::SelfTestTimeout {
                name: descriptor.name().to_string(),
                timeout_secs: limit.as_secs(),
            })
        }
    };

    if output.status.success() {
        debug!(processor = descriptor.name(), "Self test passed");
        Ok(())
    } else {
        Err(DescriptorError::SelfTestFailed {
            name: descriptor.name().to_string(),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_processor(root: &Path, dir: &str, descriptor: &str) {
        let path = root.join(dir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(DESCRIPTOR_FILE_NAME), descriptor).unwrap();
    }

    #[tokio::test]
    async fn test_discover_missing_root_fails() {
        let result = discover(Path::new("/nonexistent/processors"), Duration::from_secs(5)).await;
        assert!(matches!(result, Err(DiscoveryError::RootUnreadable { .. })));
    }

    #[tokio::test]
    async fn test_discover_skips_broken_processors() {
        let root = TempDir::new().unwrap();
        write_processor(
            root.path(),
            "b-good",
            r#"{"name": "good", "command": "true", "consumes": [{"dataType": "good/key"}]}"#,
        );
        write_processor(
            root.path(),
            "a-failing",
            r#"{"name": "failing", "command": "exit 3", "consumes": [{"dataType": "bad/key"}]}"#,
        );
        write_processor(root.path(), "c-garbage", "[1, 2");
        fs::create_dir_all(root.path().join("d-empty")).unwrap();
        fs::write(root.path().join("README"), "not a processor").unwrap();

        let found = discover(root.path(), Duration::from_secs(5)).await.unwrap();
        let names: Vec<_> = found.iter().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["good"]);
        assert_eq!(found[0].working_directory(), root.path().join("b-good"));
    }

    #[tokio::test]
    async fn test_self_test_runs_in_processor_directory() {
        let root = TempDir::new().unwrap();
        write_processor(
            root.path(),
            "needs-file",
            r#"{"name": "needs-file", "command": "test -f marker", "consumes": [{"dataType": "x"}]}"#,
        );
        fs::write(root.path().join("needs-file").join("marker"), "").unwrap();

        let found = discover(root.path(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_self_test_timeout() {
        let descriptor = ProcessorDescriptor::new(
            "sleepy",
            "sleep 5",
            std::env::temp_dir(),
            vec!["sleepy".into()],
        );
        let err = self_test(&descriptor, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, DescriptorError::SelfTestTimeout { .. }));
    }

    #[tokio::test]
    async fn test_self_test_reports_exit_code_and_stderr() {
        let descriptor = ProcessorDescriptor::new(
            "loud",
            "echo broken >&2; exit 2",
            std::env::temp_dir(),
            vec!["loud".into()],
        );
        match self_test(&descriptor, Duration::from_secs(5)).await {
            Err(DescriptorError::SelfTestFailed {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, Some(2));
                assert!(stderr.contains("broken"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
