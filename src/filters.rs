//! Filter registry and pipeline. Filters are compiled into the binary and
//! activated by dropping a file named after them into the configured filter
//! directory, so an operator's existing module layout keeps working. One
//! instance of each active filter is created per connection pair; instances
//! may hold per-connection state.

use crate::config::{DebugFlags, ProxyConfig};
use crate::ldap_protocol::{
    BindRequest, LdapMessage, ProtocolOp, SearchResultEntry, encode_ldap_message,
    parse_ldap_message,
};
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, warn};

/// A filter over decoded client requests. Runs before cache lookup and
/// before forwarding; may rewrite any field except the message ID.
pub trait RequestFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&mut self, msg: &mut LdapMessage) -> Result<()>;
}

/// A filter over search result entries. Runs on each SearchResultEntry only;
/// other response kinds bypass the pipeline.
pub trait ResponseFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&mut self, entry: &mut SearchResultEntry, message_id: i32) -> Result<()>;
}

type RequestFilterCtor = fn() -> Box<dyn RequestFilter>;
type ResponseFilterCtor = fn() -> Box<dyn ResponseFilter>;

fn new_rewrite_bind_dn() -> Box<dyn RequestFilter> {
    Box::new(RewriteBindDn)
}

/// Compiled-in request filters, by activation name.
const BUILTIN_REQUEST_FILTERS: &[(&str, RequestFilterCtor)] =
    &[("rewritebinddn", new_rewrite_bind_dn)];

/// Compiled-in response filters, by activation name. The YAML overlay is not
/// listed here; it is enabled through the yaml_attributes config knob and
/// always runs after directory-activated filters.
const BUILTIN_RESPONSE_FILTERS: &[(&str, ResponseFilterCtor)] = &[];

/// Immutable after startup: which filters are active, in activation order.
pub struct FilterRegistry {
    request_ctors: Vec<(String, RequestFilterCtor)>,
    response_ctors: Vec<(String, ResponseFilterCtor)>,
}

impl FilterRegistry {
    /// Scan the configured filter directories. Any file `<identifier>.<ext>`
    /// activates the compiled-in filter named `<identifier>`; files with no
    /// matching filter are reported and skipped. Activation order is the
    /// ascending directory listing.
    pub fn discover(cfg: &ProxyConfig) -> Result<Self> {
        let mut request_ctors = Vec::new();
        for stem in list_filter_stems(cfg.infilter_dir.as_deref())? {
            match BUILTIN_REQUEST_FILTERS.iter().find(|(n, _)| *n == stem) {
                Some((name, ctor)) => {
                    debug!("registered request filter: {}", name);
                    request_ctors.push((name.to_string(), *ctor));
                }
                None => warn!("no compiled-in request filter named '{}'", stem),
            }
        }

        let mut response_ctors = Vec::new();
        for stem in list_filter_stems(cfg.outfilter_dir.as_deref())? {
            match BUILTIN_RESPONSE_FILTERS.iter().find(|(n, _)| *n == stem) {
                Some((name, ctor)) => {
                    debug!("registered response filter: {}", name);
                    response_ctors.push((name.to_string(), *ctor));
                }
                None => warn!("no compiled-in response filter named '{}'", stem),
            }
        }

        Ok(Self {
            request_ctors,
            response_ctors,
        })
    }

    /// Fresh request filter instances for one connection pair.
    pub fn instantiate_request(&self) -> Vec<Box<dyn RequestFilter>> {
        self.request_ctors.iter().map(|(_, ctor)| ctor()).collect()
    }

    /// Fresh response filter instances for one connection pair.
    pub fn instantiate_response(&self) -> Vec<Box<dyn ResponseFilter>> {
        self.response_ctors.iter().map(|(_, ctor)| ctor()).collect()
    }

    pub fn request_filter_count(&self) -> usize {
        self.request_ctors.len()
    }

    pub fn response_filter_count(&self) -> usize {
        self.response_ctors.len()
    }
}

/// File stems of a filter directory in ascending name order. A missing or
/// unset directory yields no filters.
fn list_filter_stems(dir: Option<&Path>) -> Result<Vec<String>> {
    let Some(dir) = dir else {
        return Ok(Vec::new());
    };
    if !dir.exists() {
        warn!("filter directory {:?} does not exist", dir);
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = Vec::new();
    for dent in std::fs::read_dir(dir).with_context(|| format!("Scan filter dir {:?}", dir))? {
        let dent = dent?;
        let path = dent.path();
        if !path.is_file() {
            continue;
        }
        // Only <identifier>.<ext> registers; bare files are ignored.
        if path.extension().is_none() {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Error kind distinguishing a fatal pipeline failure (post-filter encode
/// validation) from the recoverable per-filter errors that are logged and
/// skipped inside the runners.
#[derive(Debug)]
pub struct FilterCorrupted {
    pub filter: String,
}

impl std::fmt::Display for FilterCorrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "filter '{}' corrupted message encoding", self.filter)
    }
}

impl std::error::Error for FilterCorrupted {}

/// Run every request filter over the message in activation order.
///
/// A filter returning an error is logged and its changes discarded. With
/// `validate`, the message is re-encoded after each invocation; an encode or
/// re-parse failure is fatal to the pair (Err). Message IDs are pinned
/// across invocations. Returns whether the message was changed.
pub fn run_request_filters(
    filters: &mut [Box<dyn RequestFilter>],
    msg: &mut LdapMessage,
    validate: bool,
    dbg: &DebugFlags,
) -> Result<bool, FilterCorrupted> {
    let original = msg.clone();
    for filter in filters.iter_mut() {
        let snapshot = msg.clone();
        let message_id = msg.message_id;
        match filter.apply(msg) {
            Ok(()) => {
                // Filters must not touch the message ID.
                msg.message_id = message_id;
                if validate && !reencodes_cleanly(msg) {
                    *msg = snapshot;
                    return Err(FilterCorrupted {
                        filter: filter.name().to_string(),
                    });
                }
                if dbg.filter && *msg != snapshot {
                    debug!("request filter '{}' changed message {}", filter.name(), message_id);
                }
            }
            Err(e) => {
                warn!("request filter '{}' failed: {:#}; message unchanged", filter.name(), e);
                *msg = snapshot;
            }
        }
    }
    Ok(*msg != original)
}

/// Run every response filter over a SearchResultEntry message. Non-entry
/// messages pass through untouched. Same error policy as the request side.
pub fn run_response_filters(
    filters: &mut [Box<dyn ResponseFilter>],
    msg: &mut LdapMessage,
    validate: bool,
    dbg: &DebugFlags,
) -> Result<bool, FilterCorrupted> {
    if !matches!(msg.protocol_op, ProtocolOp::SearchResultEntry(_)) {
        return Ok(false);
    }
    let original = msg.clone();
    let message_id = msg.message_id;
    for filter in filters.iter_mut() {
        let snapshot = msg.clone();
        let result = match &mut msg.protocol_op {
            ProtocolOp::SearchResultEntry(entry) => filter.apply(entry, message_id),
            _ => unreachable!("checked above"),
        };
        match result {
            Ok(()) => {
                msg.message_id = message_id;
                if validate && !reencodes_cleanly(msg) {
                    *msg = snapshot;
                    return Err(FilterCorrupted {
                        filter: filter.name().to_string(),
                    });
                }
                if dbg.filter && *msg != snapshot {
                    debug!("response filter '{}' changed entry for message {}", filter.name(), message_id);
                }
            }
            Err(e) => {
                warn!("response filter '{}' failed: {:#}; entry unchanged", filter.name(), e);
                *msg = snapshot;
            }
        }
    }
    Ok(*msg != original)
}

/// A message is considered intact when it encodes and the encoding parses
/// back. Catches filters that splice invalid raw bytes (e.g. controls).
fn reencodes_cleanly(msg: &LdapMessage) -> bool {
    match encode_ldap_message(msg) {
        Ok(bytes) => parse_ldap_message(&bytes).is_ok(),
        Err(_) => false,
    }
}

/// Rewrites e-mail style bind DNs (`cn=user@dom.tld`) into directory DNs
/// (`uid=user,dc=dom,dc=tld`). Non-matching names pass through.
pub struct RewriteBindDn;

impl RequestFilter for RewriteBindDn {
    fn name(&self) -> &'static str {
        "rewritebinddn"
    }

    fn apply(&mut self, msg: &mut LdapMessage) -> Result<()> {
        if let ProtocolOp::BindRequest(BindRequest { name, .. }) = &mut msg.protocol_op {
            if let Some(rewritten) = rewrite_mail_dn(name) {
                debug!("bind DN rewritten: {} -> {}", name, rewritten);
                *name = rewritten;
            }
        }
        Ok(())
    }
}

fn rewrite_mail_dn(name: &str) -> Option<String> {
    let rest = name.strip_prefix("cn=")?;
    let (local, domain) = rest.split_once('@')?;
    if local.is_empty() || domain.is_empty() || local.contains(',') {
        return None;
    }
    let mut dn = format!("uid={}", local);
    for part in domain.split('.') {
        if part.is_empty() {
            return None;
        }
        dn.push_str(",dc=");
        dn.push_str(part);
    }
    Some(dn)
}
