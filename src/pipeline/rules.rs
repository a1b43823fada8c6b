//! Deterministic triage rules, evaluated before any model call.
//!
//! A match settles the label on the spot:
//! - noreply/no-reply senders → spam_or_automated
//! - Marketing/newsletter domains → spam_or_automated
//! - Mailing-list and auto-submitted headers → spam_or_automated
//! - "Unsubscribe" subjects and footers → spam_or_automated
//! - Transactional (shipping, receipts, password resets) → no_action
//! - Mail sent by the user themselves → no_action
//!
//! No match means the classifier asks the model.

use regex::Regex;
use tracing::debug;

use crate::config::TriageConfig;
use crate::pipeline::types::{DecisionSource, Message, TriageDecision, TriageLabel};

/// Part of the message a rule inspects.
#[derive(Debug, Clone)]
pub enum RuleField {
    Sender,
    Subject,
    Content,
    /// A raw header value, by case-insensitive name.
    Header(String),
}

#[derive(Debug, Clone)]
pub struct Rule {
    /// Short name used in logs.
    pub pattern: String,
    pub regex: Regex,
    pub field: RuleField,
    pub label: TriageLabel,
    /// Rationale recorded on the decision.
    pub reason: String,
}

impl Rule {
    fn new(pattern: &str, regex: &str, field: RuleField, label: TriageLabel, reason: &str) -> Self {
        Self {
            pattern: pattern.into(),
            regex: Regex::new(regex).unwrap(),
            field,
            label,
            reason: reason.into(),
        }
    }

    fn matches(&self, message: &Message) -> bool {
        match &self.field {
            RuleField::Sender => self.regex.is_match(&message.sender),
            RuleField::Subject => self.regex.is_match(&message.subject),
            RuleField::Content => self.regex.is_match(&message.body_text),
            RuleField::Header(name) => message
                .headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case(name))
                .any(|(_, v)| self.regex.is_match(v)),
        }
    }
}

/// Ordered rule set: bypass list, self check, automated mail, then notices.
pub struct RulesEngine {
    /// Automated/bulk rules, checked first.
    ignore_rules: Vec<Rule>,
    /// Transactional rules, checked after ignore rules.
    notify_rules: Vec<Rule>,
    /// Senders that always go to the model (bypass every rule).
    always_classify_patterns: Vec<Regex>,
    /// The user's own address.
    user_address: Option<String>,
}

impl RulesEngine {
    /// Built-in patterns for automated senders and transactional notices.
    pub fn default_rules() -> Self {
        use TriageLabel::{NoAction, SpamOrAutomated};

        let ignore_rules = vec![
            Rule::new(
                "noreply@*",
                r"(?i)^(no[\-_.]?reply|do[\-_.]?not[\-_.]?reply)@",
                RuleField::Sender,
                SpamOrAutomated,
                "noreply sender",
            ),
            Rule::new(
                "*@marketing.*",
                r"(?i)@(marketing|newsletter|promo|campaign|mailer)\b",
                RuleField::Sender,
                SpamOrAutomated,
                "marketing/newsletter sender",
            ),
            Rule::new(
                "mailer-daemon",
                r"(?i)^(mailer[\-_]?daemon|postmaster)@",
                RuleField::Sender,
                SpamOrAutomated,
                "automated mail system",
            ),
            Rule::new(
                "notifications@github.com",
                r"(?i)^notifications@github\.com$",
                RuleField::Sender,
                SpamOrAutomated,
                "GitHub notification",
            ),
            Rule::new(
                "List-Id header",
                r".",
                RuleField::Header("List-Id".into()),
                SpamOrAutomated,
                "mailing list message",
            ),
            Rule::new(
                "List-Unsubscribe header",
                r".",
                RuleField::Header("List-Unsubscribe".into()),
                SpamOrAutomated,
                "bulk mail (List-Unsubscribe header)",
            ),
            Rule::new(
                "Precedence: bulk",
                r"(?i)^\s*(bulk|list|junk)\s*$",
                RuleField::Header("Precedence".into()),
                SpamOrAutomated,
                "bulk precedence",
            ),
            Rule::new(
                "Auto-Submitted",
                r"(?i)^\s*auto-",
                RuleField::Header("Auto-Submitted".into()),
                SpamOrAutomated,
                "auto-submitted message",
            ),
            Rule::new(
                "unsubscribe in subject",
                r"(?i)\bunsubscribe\b",
                RuleField::Subject,
                SpamOrAutomated,
                "newsletter/marketing (unsubscribe in subject)",
            ),
            Rule::new(
                "unsubscribe footer",
                r"(?i)(click here to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
                RuleField::Content,
                SpamOrAutomated,
                "bulk/marketing email (unsubscribe footer)",
            ),
        ];

        let notify_rules = vec![
            Rule::new(
                "shipping update",
                r"(?i)(your (order|package|shipment)|tracking (number|update)|has (shipped|been delivered)|out for delivery)",
                RuleField::Content,
                NoAction,
                "shipping/delivery update",
            ),
            Rule::new(
                "payment receipt",
                r"(?i)(payment (received|confirmed)|receipt for|invoice #|your (receipt|transaction))",
                RuleField::Content,
                NoAction,
                "payment/receipt",
            ),
            Rule::new(
                "account security",
                r"(?i)(password reset|reset your password|verification code|security alert)",
                RuleField::Subject,
                NoAction,
                "account/security notice",
            ),
        ];

        Self {
            ignore_rules,
            notify_rules,
            always_classify_patterns: Vec::new(),
            user_address: None,
        }
    }

    /// Default rules plus the user's configured overrides.
    pub fn from_config(config: &TriageConfig) -> Result<Self, regex::Error> {
        let mut engine = Self::default_rules();
        engine.user_address = config.user_address.clone();
        for pattern in &config.extra_ignore_senders {
            engine.add_ignore_rule(pattern, RuleField::Sender, "configured ignore sender")?;
        }
        for pattern in &config.always_classify_senders {
            engine.add_always_classify(pattern)?;
        }
        Ok(engine)
    }

    /// No rules at all; every message reaches the model.
    pub fn empty() -> Self {
        Self {
            ignore_rules: Vec::new(),
            notify_rules: Vec::new(),
            always_classify_patterns: Vec::new(),
            user_address: None,
        }
    }

    /// Set the user's own address; their messages are never answered.
    pub fn with_user_address(mut self, address: impl Into<String>) -> Self {
        self.user_address = Some(address.into());
        self
    }

    /// Add a sender pattern that always reaches the model (bypasses every rule).
    pub fn add_always_classify(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.always_classify_patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Treat matches of `regex` on `field` as automated mail.
    pub fn add_ignore_rule(
        &mut self,
        regex: &str,
        field: RuleField,
        reason: &str,
    ) -> Result<(), regex::Error> {
        let compiled = Regex::new(regex)?;
        self.ignore_rules.push(Rule {
            pattern: regex.to_string(),
            regex: compiled,
            field,
            label: TriageLabel::SpamOrAutomated,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// First matching rule's decision, or `None` to defer to the model.
    pub fn evaluate(&self, message: &Message) -> Option<TriageDecision> {
        let bypass = self
            .always_classify_patterns
            .iter()
            .any(|re| re.is_match(&message.sender));
        if bypass {
            debug!(
                sender = %message.sender,
                "Sender matches always-classify pattern, bypassing rules"
            );
            return None;
        }

        if let Some(ref me) = self.user_address
            && me.eq_ignore_ascii_case(&message.sender)
        {
            return Some(TriageDecision::new(
                &message.id,
                TriageLabel::NoAction,
                Some("sent by you".into()),
                DecisionSource::Rules,
            ));
        }

        let matched = self
            .ignore_rules
            .iter()
            .chain(self.notify_rules.iter())
            .find(|rule| rule.matches(message))?;

        debug!(
            id = %message.id,
            sender = %message.sender,
            rule = %matched.pattern,
            label = matched.label.label(),
            "Message matched triage rule"
        );
        Some(TriageDecision::new(
            &message.id,
            matched.label,
            Some(matched.reason.clone()),
            DecisionSource::Rules,
        ))
    }
}
