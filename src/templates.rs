//! Response templates: per-recipient reply tables and the notification
//! template used by the gateway.
//!
//! Patterns use positional placeholders `{0}`, `{1}`, …; `{{` and `}}`
//! produce literal braces. A placeholder without a value is an error.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::error::{ConfigError, TemplateError};

/// A reply for one category: either just a body, or a body with its own
/// subject pattern.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReplyTemplate {
    Body(String),
    Full { subject: String, body: String },
}

impl ReplyTemplate {
    fn subject(&self) -> Option<&str> {
        match self {
            ReplyTemplate::Body(_) => None,
            ReplyTemplate::Full { subject, .. } => Some(subject),
        }
    }

    fn body(&self) -> &str {
        match self {
            ReplyTemplate::Body(body) => body,
            ReplyTemplate::Full { body, .. } => body,
        }
    }
}

/// Subject and body patterns for the recipient notification.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmissionTemplate {
    pub subject: String,
    pub body: String,
}

/// All templates for one recipient mailbox.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseTemplateSet {
    /// Category key → reply.
    pub subjects: BTreeMap<String, ReplyTemplate>,
    /// Subject used when a reply has none of its own.
    #[serde(default = "default_reply_subject")]
    pub reply_subject: String,
    pub form_submission_template: SubmissionTemplate,
    #[serde(default)]
    pub signature: Option<String>,
    /// Category used when nothing in the subject matches.
    #[serde(default = "default_fallback")]
    pub fallback: String,
}

fn default_reply_subject() -> String {
    "Re: {1}".to_string()
}

fn default_fallback() -> String {
    "general".to_string()
}

impl ResponseTemplateSet {
    /// Pick the category for a subject line.
    ///
    /// Exact (case-insensitive) key match first, then the longest key
    /// contained in the subject (ties go to the lexicographically smaller
    /// key), then the fallback category if it is configured.
    pub fn categorize(&self, subject: &str) -> Option<&str> {
        let needle = subject.trim().to_lowercase();

        if let Some(key) = self
            .subjects
            .keys()
            .find(|k| k.trim().to_lowercase() == needle)
        {
            return Some(key);
        }

        let mut best: Option<&str> = None;
        for key in self.subjects.keys() {
            let lowered = key.trim().to_lowercase();
            if lowered.is_empty() || !needle.contains(&lowered) {
                continue;
            }
            // BTreeMap iterates in key order, so a strict `>` keeps the
            // smaller key on ties.
            if best.is_none_or(|b| key.trim().len() > b.trim().len()) {
                best = Some(key);
            }
        }
        if best.is_some() {
            return best;
        }

        self.subjects
            .get_key_value(&self.fallback)
            .map(|(k, _)| k.as_str())
    }
}

/// A resolved reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub category: String,
    pub subject: String,
    pub body: String,
}

/// Read-only table of template sets keyed by recipient mailbox.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    sets: HashMap<String, ResponseTemplateSet>,
}

impl TemplateStore {
    pub fn new(sets: HashMap<String, ResponseTemplateSet>) -> Self {
        let sets = sets
            .into_iter()
            .map(|(mailbox, set)| (mailbox.to_lowercase(), set))
            .collect();
        Self { sets }
    }

    /// Parse a JSON template table.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let sets: HashMap<String, ResponseTemplateSet> =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(Self::new(sets))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, recipient: &str) -> Option<&ResponseTemplateSet> {
        self.sets.get(&recipient.to_lowercase())
    }

    fn set(&self, recipient: &str) -> Result<&ResponseTemplateSet, TemplateError> {
        self.get(recipient)
            .ok_or_else(|| TemplateError::UnknownRecipient {
                recipient: recipient.to_string(),
            })
    }

    /// Category for `subject` in `recipient`'s table.
    pub fn categorize(&self, recipient: &str, subject: &str) -> Result<String, TemplateError> {
        let set = self.set(recipient)?;
        set.categorize(subject)
            .map(str::to_string)
            .ok_or_else(|| TemplateError::NoCategory {
                recipient: recipient.to_string(),
                subject: subject.to_string(),
            })
    }

    /// Render the reply for `category`, with the signature appended.
    ///
    /// Interpolants are plain text: they are HTML-escaped in the body and
    /// used as-is in the subject header.
    pub fn resolve(
        &self,
        recipient: &str,
        category: &str,
        interpolants: &[&str],
    ) -> Result<Resolved, TemplateError> {
        let set = self.set(recipient)?;
        let template = set
            .subjects
            .get(category)
            .ok_or_else(|| TemplateError::UnknownCategory {
                recipient: recipient.to_string(),
                category: category.to_string(),
            })?;

        let subject_pattern = template.subject().unwrap_or(&set.reply_subject);
        let subject = interpolate(subject_pattern, interpolants)?;

        let escaped: Vec<String> = interpolants.iter().map(|v| escape_html(v)).collect();
        let escaped: Vec<&str> = escaped.iter().map(String::as_str).collect();
        let mut body = interpolate(template.body(), &escaped)?;
        if let Some(signature) = &set.signature {
            body.push_str(signature);
        }

        Ok(Resolved {
            category: category.to_string(),
            subject,
            body,
        })
    }

    /// Render the notification sent to `recipient` for a form submission.
    ///
    /// Placeholders: `{0}` name, `{1}` email, `{2}` subject, `{3}` content.
    /// Body values are HTML-escaped and the content's newlines become
    /// `<br>`; the subject header gets the raw values.
    pub fn render_submission(
        &self,
        recipient: &str,
        name: &str,
        email: &str,
        subject: &str,
        content: &str,
    ) -> Result<(String, String), TemplateError> {
        let template = &self.set(recipient)?.form_submission_template;

        let rendered_subject = interpolate(&template.subject, &[name, email, subject])?;

        let name = escape_html(name);
        let email = escape_html(email);
        let subject = escape_html(subject);
        let content = escape_html(content).replace("\r\n", "\n").replace('\n', "<br>");
        let rendered_body = interpolate(
            &template.body,
            &[name.as_str(), email.as_str(), subject.as_str(), content.as_str()],
        )?;
        Ok((rendered_subject, rendered_body))
    }
}

/// Substitute positional placeholders.
pub fn interpolate(pattern: &str, values: &[&str]) -> Result<String, TemplateError> {
    let malformed = || TemplateError::MalformedPattern {
        pattern: pattern.to_string(),
    };

    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_digit() => digits.push(d),
                        _ => return Err(malformed()),
                    }
                }
                let index: usize = digits.parse().map_err(|_| malformed())?;
                let value = values
                    .get(index)
                    .ok_or_else(|| TemplateError::MissingInterpolant {
                        index,
                        pattern: pattern.to_string(),
                    })?;
                out.push_str(value);
            }
            '}' => return Err(malformed()),
            other => out.push(other),
        }
    }

    Ok(out)
}

/// Minimal HTML escaping for user-supplied text placed into HTML bodies.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}
