//! Re-logs processor stderr under the processor's span.

use once_cell::sync::Lazy;
use regex_lite::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, error, info, trace, warn, Level};

static SEVERITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*\[?(trace|debug|info|warning|warn|error|fatal)\]?:?(?:\s+|$)(.*)$")
        .expect("severity pattern is valid")
});

/// Consecutive read failures after which the pipe is given up on.
const MAX_READ_ERRORS: usize = 3;

/// Splits a stderr line into its severity and message.
///
/// Lines without a recognised severity prefix are treated as errors.
fn classify_line(line: &str) -> (Level, &str) {
    let Some(caps) = SEVERITY.captures(line) else {
        return (Level::ERROR, line);
    };
    let (Some(token), Some(message)) = (caps.get(1), caps.get(2)) else {
        return (Level::ERROR, line);
    };
    let level = match token.as_str().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        _ => Level::ERROR,
    };
    (level, message.as_str())
}

fn relay_line(raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        return;
    }
    let (level, message) = classify_line(line);
    match level {
        Level::TRACE => trace!(target: "processor", "{}", message),
        Level::DEBUG => debug!(target: "processor", "{}", message),
        Level::INFO => info!(target: "processor", "{}", message),
        Level::WARN => warn!(target: "processor", "{}", message),
        _ => error!(target: "processor", "{}", message),
    }
}

/// Reads `stream` line by line until EOF. Run it inside the processor span.
///
/// Bytes that are not UTF-8 are logged lossily. The pipe is read until EOF
/// and never decides the outcome of the run.
pub async fn relay_stderr<R>(stream: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut failures = 0;
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                failures = 0;
                relay_line(&line);
            }
            Err(e) => {
                relay_line(&line);
                failures += 1;
                if failures >= MAX_READ_ERRORS {
                    warn!("Giving up on processor stderr: {}", e);
                    break;
                }
                debug!("Failed to read processor stderr: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_classify_prefixes() {
        assert_eq!(classify_line("INFO: Sample log message"), (Level::INFO, "Sample log message"));
        assert_eq!(classify_line("[debug] parsing"), (Level::DEBUG, "parsing"));
        assert_eq!(classify_line("  Warning: slow disk"), (Level::WARN, "slow disk"));
        assert_eq!(classify_line("trace details"), (Level::TRACE, "details"));
        assert_eq!(classify_line("FATAL: giving up"), (Level::ERROR, "giving up"));
    }

    #[test]
    fn test_unprefixed_lines_are_errors() {
        assert_eq!(
            classify_line("Traceback (most recent call last):"),
            (Level::ERROR, "Traceback (most recent call last):")
        );
        assert_eq!(classify_line("information only"), (Level::ERROR, "information only"));
    }

    #[tokio::test]
    async fn test_relay_reads_until_eof() {
        let input: &[u8] = b"INFO: one\n\nwarn: two\r\nthree";
        relay_stderr(input).await;
    }

    #[tokio::test]
    async fn test_relay_survives_invalid_utf8() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let relay = tokio::spawn(relay_stderr(reader));

        writer.write_all(b"caf\xe9\n").await.unwrap();
        for i in 0..100 {
            writer
                .write_all(format!("INFO: line {}\n", i).as_bytes())
                .await
                .unwrap();
        }
        drop(writer);

        tokio::time::timeout(std::time::Duration::from_secs(5), relay)
            .await
            .expect("relay should drain until EOF")
            .unwrap();
    }
}
