//! Worker and request environment
//!
//! What the pool contributes to a worker's process environment and to the
//! per-request variables the host sends over the channel, plus the body admission
//! check that runs before a worker is claimed.

use crate::config::ServerPoolConfig;
use crate::error::PoolError;
use std::collections::BTreeMap;
use std::path::Path;

/// Environment injected into every spawned worker
pub fn worker_environment(config: &ServerPoolConfig) -> BTreeMap<String, String> {
    config
        .default_env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// CGI variable name for a request header: `X-Real-IP` -> `HTTP_X_REAL_IP`
pub fn header_variable(name: &str) -> String {
    let mut var = String::with_capacity(name.len() + 5);
    var.push_str("HTTP_");
    for c in name.chars() {
        if c == '-' {
            var.push('_');
        } else {
            var.push(c.to_ascii_uppercase());
        }
    }
    var
}

/// Request variables for the configured pass-through headers present in `headers`
///
/// Header names match case-insensitively; headers not listed in `pass_headers`
/// are ignored.
pub fn pass_through_headers<'a, I>(config: &ServerPoolConfig, headers: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut vars = BTreeMap::new();
    if config.pass_headers.is_empty() {
        return vars;
    }
    for (name, value) in headers {
        if config
            .pass_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
        {
            vars.insert(header_variable(name), value.to_string());
        }
    }
    vars
}

/// Path variables rewritten when the path-info fixup is enabled
///
/// Returns nothing when the toggle is off, leaving the host's own values intact.
pub fn fix_path_info(
    config: &ServerPoolConfig,
    script_filename: &Path,
    path_info: &str,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    if !config.php_fix_pathinfo {
        return vars;
    }
    let script = script_filename.to_string_lossy().into_owned();
    vars.insert("SCRIPT_FILENAME".to_string(), script.clone());
    vars.insert("PATH_TRANSLATED".to_string(), script);
    vars.insert("PATH_INFO".to_string(), path_info.to_string());
    vars
}

/// Where an admitted request body is buffered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyBuffer {
    Memory,
    /// Too large for memory; the host spools it to a temporary file
    Spool,
}

/// Check a request body length against the admission limits
pub fn admit_request_body(config: &ServerPoolConfig, len: u64) -> Result<BodyBuffer, PoolError> {
    if len > config.max_request_len {
        return Err(PoolError::RequestTooLarge {
            len,
            limit: config.max_request_len,
        });
    }
    if len > config.max_mem_request_len {
        Ok(BodyBuffer::Spool)
    } else {
        Ok(BodyBuffer::Memory)
    }
}
