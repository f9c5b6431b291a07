//! Metric path and measurement rendering.
//!
//! Templates are plain strings with `%NAME%` placeholders. Rendering makes a
//! single left-to-right pass: a placeholder whose name is known is replaced
//! by its escaped value, anything else, including unknown placeholders and
//! stray `%` characters, is copied verbatim. Only substituted values are
//! escaped, never the template's own text.
//!
//! The built-in variables are:
//!
//! * `HOST`: the host name,
//! * `DOMAIN`: the network domain, see [`domain`],
//! * `ENV_<key>`: one per process environment variable.
//!
//! Per-metric variables `COUNTER_CATEGORY`, `COUNTER_NAME`,
//! `COUNTER_INSTANCE` and `COUNTER_VALUE` are layered over these by
//! [`Formatter::render`].

use std::{borrow::Cow, env, fs};

use once_cell::sync::OnceCell;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::metric::CollectedMetric;

const NIS_DOMAIN_PATH: &str = "/proc/sys/kernel/domainname";

static DOMAIN: OnceCell<String> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How substituted values are made safe for the wire.
pub enum Escape {
    /// Replace every character outside `[A-Za-z0-9_]` with `_`. Used for
    /// Graphite paths, where `.` is the hierarchy separator.
    Sanitize,
    /// Backslash-escape `,`, space and `=` per InfluxDB line protocol.
    LineProtocol,
}

impl Escape {
    /// Append `value`, escaped, to `out`. An empty value becomes `_` so that
    /// no path segment or tag value ever renders empty.
    pub fn push(self, out: &mut String, value: &str) {
        if value.is_empty() {
            out.push('_');
            return;
        }
        match self {
            Escape::Sanitize => out.extend(value.chars().map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c
                } else {
                    '_'
                }
            })),
            Escape::LineProtocol => {
                for c in value.chars() {
                    if matches!(c, ',' | ' ' | '=') {
                        out.push('\\');
                    }
                    out.push(c);
                }
            }
        }
    }

    /// Escape `value` into a new string.
    #[must_use]
    pub fn apply(self, value: &str) -> String {
        let mut out = String::with_capacity(value.len());
        self.push(&mut out, value);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// A case-sensitive mapping from variable name to raw value.
pub struct Variables {
    inner: FxHashMap<String, String>,
}

impl Variables {
    /// Create an empty set of variables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The always-available variables: `HOST`, `DOMAIN` and one `ENV_<key>`
    /// per environment variable. Variables whose key or value is not valid
    /// unicode are skipped.
    #[must_use]
    pub fn builtin() -> Self {
        let mut vars = Self::new();
        for (key, value) in env::vars_os() {
            if let (Some(key), Some(value)) = (key.to_str(), value.to_str()) {
                vars.insert(format!("ENV_{key}"), value);
            }
        }
        vars.insert("HOST", host());
        vars.insert("DOMAIN", domain());
        vars
    }

    /// Set `name` to `value`, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.insert(name.into(), value.into());
    }

    /// Look up the raw value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner.get(name).map(String::as_str)
    }

    #[must_use]
    /// Number of variables held.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    /// Whether no variables are held.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Variables
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut vars = Self::new();
        for (k, v) in iter {
            vars.insert(k, v);
        }
        vars
    }
}

/// Render `template` against `vars`, sanitizing every substituted value.
#[must_use]
pub fn format(template: &str, vars: &Variables) -> String {
    let mut out = String::with_capacity(template.len());
    substitute(&mut out, template, Escape::Sanitize, |name| {
        vars.get(name).map(Cow::Borrowed)
    });
    out
}

fn substitute<'a, F>(out: &mut String, template: &str, escape: Escape, lookup: F)
where
    F: Fn(&str) -> Option<Cow<'a, str>>,
{
    let mut rest = template;
    while let Some(open) = rest.find('%') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('%') else {
            out.push_str(&rest[open..]);
            return;
        };
        let name = &after[..close];
        if let Some(value) = lookup(name) {
            escape.push(out, &value);
            rest = &after[close + 1..];
        } else {
            // The closing `%` may open the next placeholder.
            out.push('%');
            rest = after;
        }
    }
    out.push_str(rest);
}

#[derive(Debug, Clone)]
/// Renders [`CollectedMetric`] templates for one output.
pub struct Formatter {
    defaults: Variables,
    prefix: String,
    escape: Escape,
}

impl Formatter {
    /// Create a [`Formatter`] over the [`Variables::builtin`] set.
    #[must_use]
    pub fn new(prefix: impl Into<String>, escape: Escape) -> Self {
        Self::with_defaults(Variables::builtin(), prefix, escape)
    }

    /// Create a [`Formatter`] over an explicit base set of variables.
    #[must_use]
    pub fn with_defaults(defaults: Variables, prefix: impl Into<String>, escape: Escape) -> Self {
        Self {
            defaults,
            prefix: prefix.into(),
            escape,
        }
    }

    #[must_use]
    /// The escaping applied to substituted values.
    pub fn escape(&self) -> Escape {
        self.escape
    }

    /// Render the template of `metric`. The prefix is prepended verbatim
    /// after substitution.
    #[must_use]
    pub fn render(&self, metric: &CollectedMetric) -> String {
        let mut out = String::with_capacity(self.prefix.len() + metric.template().len() + 32);
        out.push_str(&self.prefix);
        substitute(&mut out, metric.template(), self.escape, |name| match name {
            "COUNTER_CATEGORY" => Some(Cow::Borrowed(metric.category())),
            "COUNTER_NAME" => Some(Cow::Borrowed(metric.name())),
            "COUNTER_INSTANCE" => Some(Cow::Borrowed(metric.instance().unwrap_or_default())),
            "COUNTER_VALUE" => Some(Cow::Owned(format!("{:.3}", metric.value()))),
            other => self.defaults.get(other).map(Cow::Borrowed),
        });
        out
    }
}

/// The host name of this machine, or `localhost` if it cannot be read.
#[must_use]
pub fn host() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(err) => {
            warn!("Unable to read host name, using localhost: {err}");
            "localhost".to_string()
        }
    }
}

/// The network domain of this machine, resolved once per process.
///
/// The NIS domain is preferred when set. Otherwise the suffix of a dotted
/// host name is used, and failing that the host name itself stands in as a
/// workgroup-style identifier.
pub fn domain() -> String {
    DOMAIN
        .get_or_init(|| {
            let nis = fs::read_to_string(NIS_DOMAIN_PATH).ok();
            resolve_domain(nis.as_deref(), &host())
        })
        .clone()
}

fn resolve_domain(nis: Option<&str>, host: &str) -> String {
    if let Some(nis) = nis.map(str::trim) {
        if !nis.is_empty() && nis != "(none)" {
            return nis.to_string();
        }
    }
    match host.split_once('.') {
        Some((_, suffix)) if !suffix.is_empty() => suffix.to_string(),
        _ => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use proptest::prelude::*;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs.iter().copied().collect()
    }

    #[test]
    fn substitutes_and_sanitizes_values() {
        let v = vars(&[("HOST", "box1"), ("COUNTER_INSTANCE", "cpu 0")]);
        assert_eq!(format("%HOST%.cpu.%COUNTER_INSTANCE%", &v), "box1.cpu.cpu_0");
    }

    #[test]
    fn unknown_placeholders_pass_through() {
        let v = vars(&[("HOST", "box1")]);
        assert_eq!(format("%UNKNOWN%.%HOST%", &v), "%UNKNOWN%.box1");
        assert_eq!(format("100%.%HOST%", &v), "100%.box1");
        assert_eq!(format("trailing %HOST", &v), "trailing %HOST");
        assert_eq!(format("%%HOST%%", &v), "%box1%");
    }

    #[test]
    fn names_are_case_sensitive() {
        let v = vars(&[("HOST", "box1")]);
        assert_eq!(format("%host%", &v), "%host%");
    }

    #[test]
    fn empty_value_becomes_underscore() {
        let v = vars(&[("COUNTER_INSTANCE", "")]);
        assert_eq!(format("a.%COUNTER_INSTANCE%.b", &v), "a._.b");
    }

    #[test]
    fn line_protocol_escaping() {
        assert_eq!(Escape::LineProtocol.apply("eth 0,x=1"), "eth\\ 0\\,x\\=1");
        assert_eq!(Escape::LineProtocol.apply("plain.name"), "plain.name");
        assert_eq!(Escape::Sanitize.apply("plain.name"), "plain_name");
    }

    #[test]
    fn render_layers_metric_over_defaults() {
        let defaults = vars(&[("HOST", "web-01"), ("COUNTER_NAME", "shadowed")]);
        let formatter = Formatter::with_defaults(defaults, "servers.", Escape::Sanitize);
        let metric = CollectedMetric::new_at(
            "%HOST%.%COUNTER_CATEGORY%.%COUNTER_INSTANCE%.%COUNTER_NAME%.%COUNTER_VALUE%",
            "Processor",
            "% Processor Time",
            Some("_Total".to_string()),
            12.5,
            UNIX_EPOCH + Duration::from_secs(1),
        )
        .expect("valid metric");

        assert_eq!(
            formatter.render(&metric),
            "servers.web_01.Processor._Total.__Processor_Time.12_500"
        );
    }

    #[test]
    fn render_absent_instance_is_empty() {
        let formatter = Formatter::with_defaults(Variables::new(), "", Escape::Sanitize);
        let metric = CollectedMetric::new("mem.%COUNTER_INSTANCE%", "Memory", "Free Bytes", None, 1.0)
            .expect("valid metric");
        assert_eq!(formatter.render(&metric), "mem._");
    }

    #[test]
    fn builtin_exposes_environment() {
        let Some((key, value)) = env::vars_os()
            .find_map(|(k, v)| Some((k.to_str()?.to_string(), v.to_str()?.to_string())))
        else {
            return;
        };
        let builtin = Variables::builtin();
        assert_eq!(builtin.get(&format!("ENV_{key}")), Some(value.as_str()));
        assert!(builtin.get("HOST").is_some());
        assert!(builtin.get("DOMAIN").is_some());
    }

    #[test]
    fn domain_resolution_order() {
        assert_eq!(resolve_domain(Some("corp.example\n"), "web.other.org"), "corp.example");
        assert_eq!(resolve_domain(Some("(none)\n"), "web.other.org"), "other.org");
        assert_eq!(resolve_domain(None, "web.other.org"), "other.org");
        assert_eq!(resolve_domain(Some(""), "web"), "web");
        assert_eq!(resolve_domain(None, "web."), "web.");
    }

    #[test]
    fn domain_is_cached() {
        assert_eq!(domain(), domain());
    }

    proptest! {
        #[test]
        fn sanitized_values_are_word_characters(value in any::<String>()) {
            let out = Escape::Sanitize.apply(&value);
            prop_assert!(!out.is_empty());
            prop_assert!(out.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
            if !value.is_empty() {
                prop_assert_eq!(out.chars().count(), value.chars().count());
            }
        }

        #[test]
        fn template_text_is_never_altered(literal in "[^%]{0,32}", value in any::<String>()) {
            let v = vars(&[("X", value.as_str())]);
            let rendered = format(&format!("{literal}%X%{literal}"), &v);
            prop_assert!(rendered.starts_with(&literal));
            prop_assert!(rendered.ends_with(&literal));
        }
    }
}
