//! Match rules: which messages a listener (or a peer on the bus) wants.
//!
//! A rule renders in bus match-rule syntax
//! (`type='signal',interface='x',member='y',arg0='z'`) and parses back.
//! Argument filters cover leading positions only: `arg0..argN` must be
//! contiguous from zero.

use buslink_types::{BusError, BusResult, Message, MessageKind, ObjectPath};
use std::fmt;

/// A message filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct MatchRule {
    pub kind: Option<MessageKind>,
    pub sender: Option<String>,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    /// String filters on the leading body arguments, by position.
    pub args: Vec<String>,
}

impl MatchRule {
    /// A rule matching signals.
    pub fn signal() -> Self {
        Self {
            kind: Some(MessageKind::Signal),
            ..Self::default()
        }
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn path(mut self, path: ObjectPath) -> Self {
        self.path = Some(path);
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Add a filter on the next leading argument.
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    /// True when every set field agrees with `msg`, comparing `sender`
    /// literally.
    pub fn matches(&self, msg: &Message) -> bool {
        self.matches_with(msg, |name| Some(name.to_string()))
    }

    /// Bus-side matching. Messages carry the sender's unique name, so a
    /// well-known `sender` is resolved through `owner` first.
    pub fn matches_with(&self, msg: &Message, owner: impl Fn(&str) -> Option<String>) -> bool {
        if let Some(sender) = &self.sender {
            let want = if is_unique_name(sender) {
                Some(sender.clone())
            } else {
                owner(sender)
            };
            if want.is_none() || msg.sender != want {
                return false;
            }
        }
        self.matches_fields(msg)
    }

    /// Matching on the receiving connection. The bus already resolved a
    /// well-known `sender` when it routed the message here; only a unique
    /// name is compared again.
    pub fn matches_delivered(&self, msg: &Message) -> bool {
        if let Some(sender) = self.sender.as_deref().filter(|s| is_unique_name(s)) {
            if msg.sender.as_deref() != Some(sender) {
                return false;
            }
        }
        self.matches_fields(msg)
    }

    fn matches_fields(&self, msg: &Message) -> bool {
        if self.kind.is_some_and(|k| k != msg.kind) {
            return false;
        }
        if self.path.is_some() && self.path != msg.path {
            return false;
        }
        if let Some(interface) = &self.interface {
            if msg.interface.as_deref() != Some(interface.as_str()) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if msg.member.as_deref() != Some(member.as_str()) {
                return false;
            }
        }
        self.args
            .iter()
            .enumerate()
            .all(|(i, want)| msg.arg_str(i) == Some(want.as_str()))
    }

    /// Parse a rule in bus match-rule syntax.
    pub fn parse(rule: &str) -> BusResult<Self> {
        let mut out = Self::default();
        for (key, value) in split_pairs(rule)? {
            match key.as_str() {
                "type" => {
                    out.kind = Some(
                        MessageKind::parse(&value)
                            .ok_or_else(|| invalid(rule, &format!("unknown type '{value}'")))?,
                    );
                }
                "sender" => out.sender = Some(value),
                "path" => out.path = Some(ObjectPath::new(value)?),
                "interface" => out.interface = Some(value),
                "member" => out.member = Some(value),
                other => {
                    let index: usize = other
                        .strip_prefix("arg")
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| invalid(rule, &format!("unknown key '{other}'")))?;
                    if index != out.args.len() {
                        return Err(invalid(rule, "argument filters must be leading"));
                    }
                    out.args.push(value);
                }
            }
        }
        Ok(out)
    }
}

/// Unique connection names start with ':'.
pub fn is_unique_name(name: &str) -> bool {
    name.starts_with(':')
}

fn invalid(rule: &str, reason: &str) -> BusError {
    BusError::TypeMismatch(format!("invalid match rule \"{rule}\": {reason}"))
}

fn split_pairs(rule: &str) -> BusResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut rest = rule.trim();
    while !rest.is_empty() {
        let eq = rest.find('=').ok_or_else(|| invalid(rule, "expected key=value"))?;
        let key = rest[..eq].trim().to_string();
        let after = rest[eq + 1..]
            .strip_prefix('\'')
            .ok_or_else(|| invalid(rule, "values must be quoted"))?;
        let close = after.find('\'').ok_or_else(|| invalid(rule, "unterminated value"))?;
        pairs.push((key, after[..close].to_string()));
        rest = after[close + 1..].trim_start();
        if let Some(next) = rest.strip_prefix(',') {
            rest = next.trim_start();
        } else if !rest.is_empty() {
            return Err(invalid(rule, "expected ','"));
        }
    }
    Ok(pairs)
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(kind) = self.kind {
            parts.push(format!("type='{kind}'"));
        }
        if let Some(sender) = &self.sender {
            parts.push(format!("sender='{sender}'"));
        }
        if let Some(path) = &self.path {
            parts.push(format!("path='{path}'"));
        }
        if let Some(interface) = &self.interface {
            parts.push(format!("interface='{interface}'"));
        }
        if let Some(member) = &self.member {
            parts.push(format!("member='{member}'"));
        }
        for (i, arg) in self.args.iter().enumerate() {
            parts.push(format!("arg{i}='{arg}'"));
        }
        f.write_str(&parts.join(","))
    }
}
