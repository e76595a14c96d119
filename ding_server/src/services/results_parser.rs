//! Directives printed by a build script on stdout.
//!
//! ```text
//! version: TOKEN
//! release: COMMAND OS ARCH TOOLCHAIN PATH
//! coverage: FLOAT
//! coverage-report: PATH
//! ```
//!
//! Directives start at the beginning of a line, tokens are separated by
//! single spaces. Other lines, indented ones included, are ignored. A
//! malformed directive fails the build.

use std::path::Path;

use crate::error::{DingError, Result};
use crate::models::result::NewBuildResult;
use crate::paths::resolve_within;

#[derive(Debug, Default, PartialEq)]
pub struct Parsed {
    pub version: String,
    pub coverage: Option<f32>,
    /// Relative to the download directory.
    pub coverage_report_file: String,
    pub results: Vec<NewBuildResult>,
}

/// Parse the stdout of the build step. Release paths must stay within
/// `checkout_dir`, the coverage report within `dl_dir`, and both must exist.
pub fn parse(build_id: i64, stdout: &str, checkout_dir: &Path, dl_dir: &Path) -> Result<Parsed> {
    let mut parsed = Parsed::default();
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split(' ').collect();
        match tokens.first().copied() {
            Some("version:") => {
                let [_, version] = tokens[..] else {
                    return Err(malformed(line, "expected exactly one version token"));
                };
                parsed.version = version.to_string();
            }
            Some("release:") => {
                let [_, command, os, arch, toolchain, path] = tokens[..] else {
                    return Err(malformed(
                        line,
                        "expected command, os, arch, toolchain and path",
                    ));
                };
                let (filename, filesize) = file_within(checkout_dir, path, line)?;
                parsed.results.push(NewBuildResult {
                    build_id,
                    command: command.to_string(),
                    os: os.to_string(),
                    arch: arch.to_string(),
                    toolchain: toolchain.to_string(),
                    filename,
                    filesize,
                });
            }
            Some("coverage:") => {
                let [_, value] = tokens[..] else {
                    return Err(malformed(line, "expected exactly one coverage value"));
                };
                let coverage: f32 = value
                    .parse()
                    .map_err(|e| malformed(line, &format!("bad coverage value: {e}")))?;
                parsed.coverage = Some(coverage);
            }
            Some("coverage-report:") => {
                let [_, path] = tokens[..] else {
                    return Err(malformed(line, "expected exactly one path"));
                };
                let (filename, _) = file_within(dl_dir, path, line)?;
                parsed.coverage_report_file = filename;
            }
            _ => {}
        }
    }
    Ok(parsed)
}

fn malformed(line: &str, why: &str) -> DingError {
    DingError::user(format!("malformed directive {line:?}: {why}"))
}

/// Resolve `path` inside `base`; returns the path relative to `base` and
/// the file size.
fn file_within(base: &Path, path: &str, line: &str) -> Result<(String, i64)> {
    let resolved = resolve_within(base, path)
        .ok_or_else(|| malformed(line, "path is outside of its directory"))?;
    let meta = std::fs::metadata(&resolved)
        .map_err(|e| malformed(line, &format!("stat {}: {e}", resolved.display())))?;
    let relative = resolved
        .strip_prefix(crate::paths::clean(&base.to_string_lossy()))
        .map_err(|_| malformed(line, "path is outside of its directory"))?;
    Ok((
        relative.to_string_lossy().into_owned(),
        i64::try_from(meta.len()).unwrap_or(i64::MAX),
    ))
}
