/// Signed webhook verification and email dispatch for identity-backend
/// events.
///
/// Signed content is `{id}.{timestamp}.{raw body}`; the signature header
/// carries space-separated `v1,<base64 hmac-sha256>` candidates. The shared
/// secret arrives as `v1,<key>` (only `<key>` is the signing key) or bare.
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_ID: &str = "webhook-id";
pub const HEADER_TIMESTAMP: &str = "webhook-timestamp";
pub const HEADER_SIGNATURE: &str = "webhook-signature";

#[derive(Debug, Error)]
pub enum WebhookError {
    // 401-class
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("malformed webhook timestamp")]
    MalformedTimestamp,
    #[error("webhook timestamp outside tolerance window")]
    StaleTimestamp,
    #[error("webhook signature mismatch")]
    SignatureMismatch,
    // 400-class
    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),
    #[error("unknown email action type: {0}")]
    UnknownAction(String),
}

impl WebhookError {
    /// Authentication failures are 401; payload problems are 400
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            WebhookError::MissingHeader(_)
                | WebhookError::MalformedTimestamp
                | WebhookError::StaleTimestamp
                | WebhookError::SignatureMismatch
        )
    }
}

/// Signing key parsed out of the configured secret string.
///
/// Accepts `v1,<key>` (current format) and bare `<key>` (legacy). A
/// `whsec_`-prefixed key is base64-encoded per webhook convention; anything
/// else is used byte-for-byte.
pub struct WebhookSecret {
    key: Vec<u8>,
}

impl WebhookSecret {
    pub fn parse(secret: &str) -> Self {
        let value = secret.strip_prefix("v1,").unwrap_or(secret);

        let key = match value.strip_prefix("whsec_") {
            Some(encoded) => STANDARD
                .decode(encoded)
                .unwrap_or_else(|_| encoded.as_bytes().to_vec()),
            None => value.as_bytes().to_vec(),
        };

        Self { key }
    }

    /// Which form the configured secret had, for diagnostics that must not
    /// leak the secret itself
    pub fn format_class(secret: &str) -> &'static str {
        match (secret.starts_with("v1,"), secret.contains("whsec_")) {
            (true, _) => "v1-prefixed",
            (false, true) => "bare-whsec",
            (false, false) => "bare",
        }
    }

    fn sign(&self, id: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(id.as_bytes());
        mac.update(b".");
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(body);
        STANDARD.encode(mac.finalize().into_bytes())
    }
}

/// Verify an inbound event against the shared secret.
///
/// `signature_header` may list several space-separated candidates; the event
/// is accepted when any `v1` candidate matches (constant-time comparison).
pub fn verify_signature(
    secret: &WebhookSecret,
    id: &str,
    timestamp_header: &str,
    signature_header: &str,
    body: &[u8],
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), WebhookError> {
    let timestamp: i64 = timestamp_header
        .trim()
        .parse()
        .map_err(|_| WebhookError::MalformedTimestamp)?;

    // Replay protection
    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(WebhookError::StaleTimestamp);
    }

    let expected = secret.sign(id, timestamp, body);

    for candidate in signature_header.split_whitespace() {
        let Some(sig) = candidate.strip_prefix("v1,") else {
            continue;
        };
        if sig.as_bytes().ct_eq(expected.as_bytes()).into() {
            return Ok(());
        }
    }

    Err(WebhookError::SignatureMismatch)
}

/// Closed set of email actions the identity backend emits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailAction {
    Confirmation,
    Invite,
    Recovery,
    MagicLink,
    EmailChange,
    EmailChangedNotice,
    PasswordChangedNotice,
}

impl EmailAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signup" => Some(EmailAction::Confirmation),
            "invite" => Some(EmailAction::Invite),
            "recovery" => Some(EmailAction::Recovery),
            "magiclink" => Some(EmailAction::MagicLink),
            "email_change" => Some(EmailAction::EmailChange),
            "email_changed" => Some(EmailAction::EmailChangedNotice),
            "password_changed" => Some(EmailAction::PasswordChangedNotice),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmailAction::Confirmation => "signup",
            EmailAction::Invite => "invite",
            EmailAction::Recovery => "recovery",
            EmailAction::MagicLink => "magiclink",
            EmailAction::EmailChange => "email_change",
            EmailAction::EmailChangedNotice => "email_changed",
            EmailAction::PasswordChangedNotice => "password_changed",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventEmail {
    pub email_action_type: String,
    #[serde(default)]
    pub token_hash: String,
    #[serde(default)]
    pub redirect_to: String,
}

#[derive(Debug, Deserialize)]
pub struct EventUser {
    pub email: String,
    #[serde(default)]
    pub user_metadata: Option<serde_json::Value>,
}

/// Normalized inbound payload
#[derive(Debug, Deserialize)]
pub struct EmailEvent {
    pub user: EventUser,
    pub email: EventEmail,
}

impl EmailEvent {
    pub fn parse(body: &[u8]) -> Result<(Self, EmailAction), WebhookError> {
        let event: EmailEvent = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        if event.user.email.is_empty() {
            return Err(WebhookError::MalformedPayload(
                "user.email is empty".to_string(),
            ));
        }

        let action = EmailAction::parse(&event.email.email_action_type)
            .ok_or_else(|| WebhookError::UnknownAction(event.email.email_action_type.clone()))?;

        Ok((event, action))
    }
}

/// How the verification link is built for an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkRule {
    /// Token-hash verification URL with the given `type` query value
    Verify(&'static str),
    /// Notice-only email, no link
    None,
}

struct Template {
    subject: &'static str,
    heading: &'static str,
    body: &'static str,
    action_label: &'static str,
    link: LinkRule,
}

/// One row per action type - the whole dispatch policy lives here
fn template_for(action: EmailAction) -> Template {
    match action {
        EmailAction::Confirmation => Template {
            subject: "Confirm your email",
            heading: "Welcome!",
            body: "Confirm your email address to finish creating your account.",
            action_label: "Confirm email",
            link: LinkRule::Verify("signup"),
        },
        EmailAction::Invite => Template {
            subject: "You have been invited",
            heading: "You're invited",
            body: "You have been invited to join. Accept the invitation to get started.",
            action_label: "Accept invite",
            link: LinkRule::Verify("invite"),
        },
        EmailAction::Recovery => Template {
            subject: "Reset your password",
            heading: "Password reset",
            body: "A password reset was requested for your account. If this wasn't you, you can ignore this email.",
            action_label: "Reset password",
            link: LinkRule::Verify("recovery"),
        },
        EmailAction::MagicLink => Template {
            subject: "Your sign-in link",
            heading: "Sign in",
            body: "Use the link below to sign in. It can only be used once.",
            action_label: "Sign in",
            link: LinkRule::Verify("magiclink"),
        },
        EmailAction::EmailChange => Template {
            subject: "Confirm your new email",
            heading: "Email change",
            body: "Confirm that you want to use this address for your account.",
            action_label: "Confirm new email",
            link: LinkRule::Verify("email_change"),
        },
        EmailAction::EmailChangedNotice => Template {
            subject: "Your email was changed",
            heading: "Email changed",
            body: "The email address on your account was changed. If this wasn't you, contact support immediately.",
            action_label: "",
            link: LinkRule::None,
        },
        EmailAction::PasswordChangedNotice => Template {
            subject: "Your password was changed",
            heading: "Password changed",
            body: "The password on your account was changed. If this wasn't you, contact support immediately.",
            action_label: "",
            link: LinkRule::None,
        },
    }
}

/// A rendered, ready-to-send email
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Render the email for a verified, normalized event
pub fn build_email(action: EmailAction, event: &EmailEvent, site_url: &str) -> OutboundEmail {
    let template = template_for(action);

    let link = match template.link {
        LinkRule::Verify(verify_type) => {
            let mut url = format!(
                "{}/auth/confirm?token_hash={}&type={}",
                site_url.trim_end_matches('/'),
                urlencoding::encode(&event.email.token_hash),
                verify_type,
            );
            if !event.email.redirect_to.is_empty() {
                url.push_str("&redirect_to=");
                url.push_str(&urlencoding::encode(&event.email.redirect_to));
            }
            Some(url)
        }
        LinkRule::None => None,
    };

    let html = match &link {
        Some(link) => format!(
            "<h2>{}</h2><p>{}</p><p><a href=\"{}\">{}</a></p>",
            template.heading, template.body, link, template.action_label,
        ),
        None => format!("<h2>{}</h2><p>{}</p>", template.heading, template.body),
    };

    OutboundEmail {
        to: event.user.email.clone(),
        subject: template.subject.to_string(),
        html,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "v1,whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

    fn sign_for_test(secret: &str, id: &str, timestamp: i64, body: &[u8]) -> String {
        let parsed = WebhookSecret::parse(secret);
        format!("v1,{}", parsed.sign(id, timestamp, body))
    }

    #[test]
    fn test_secret_prefix_stripping() {
        // v1-prefixed and bare forms of the same key must verify identically
        let prefixed = WebhookSecret::parse("v1,whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw");
        let bare = WebhookSecret::parse("whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw");

        let body = b"{}";
        assert_eq!(prefixed.sign("msg_1", 1700000000, body), bare.sign("msg_1", 1700000000, body));
    }

    #[test]
    fn test_verify_accepts_valid_signature() {
        let now = Utc::now();
        let body = br#"{"user":{"email":"a@b.c"}}"#;
        let signature = sign_for_test(SECRET, "msg_1", now.timestamp(), body);

        let secret = WebhookSecret::parse(SECRET);
        verify_signature(
            &secret,
            "msg_1",
            &now.timestamp().to_string(),
            &signature,
            body,
            300,
            now,
        )
        .unwrap();
    }

    #[test]
    fn test_verify_accepts_multiple_candidates() {
        let now = Utc::now();
        let body = b"payload";
        let valid = sign_for_test(SECRET, "msg_1", now.timestamp(), body);
        let header = format!("v1,bm90LXRoaXMtb25l {}", valid);

        let secret = WebhookSecret::parse(SECRET);
        verify_signature(
            &secret,
            "msg_1",
            &now.timestamp().to_string(),
            &header,
            body,
            300,
            now,
        )
        .unwrap();
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let now = Utc::now();
        let signature = sign_for_test(SECRET, "msg_1", now.timestamp(), b"original");

        let secret = WebhookSecret::parse(SECRET);
        let err = verify_signature(
            &secret,
            "msg_1",
            &now.timestamp().to_string(),
            &signature,
            b"tampered",
            300,
            now,
        )
        .unwrap_err();

        assert!(matches!(err, WebhookError::SignatureMismatch));
        assert!(err.is_auth_error());
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let now = Utc::now();
        let body = b"payload";
        let signature = sign_for_test("v1,whsec_b3RoZXIta2V5LWVudGlyZWx5", "msg_1", now.timestamp(), body);

        let secret = WebhookSecret::parse(SECRET);
        assert!(verify_signature(
            &secret,
            "msg_1",
            &now.timestamp().to_string(),
            &signature,
            body,
            300,
            now,
        )
        .is_err());
    }

    #[test]
    fn test_verify_rejects_stale_timestamp() {
        let now = Utc::now();
        let old = now.timestamp() - 3600;
        let body = b"payload";
        let signature = sign_for_test(SECRET, "msg_1", old, body);

        let secret = WebhookSecret::parse(SECRET);
        let err = verify_signature(&secret, "msg_1", &old.to_string(), &signature, body, 300, now)
            .unwrap_err();
        assert!(matches!(err, WebhookError::StaleTimestamp));
    }

    #[test]
    fn test_verify_rejects_malformed_timestamp() {
        let secret = WebhookSecret::parse(SECRET);
        let err = verify_signature(&secret, "msg_1", "not-a-number", "v1,sig", b"x", 300, Utc::now())
            .unwrap_err();
        assert!(matches!(err, WebhookError::MalformedTimestamp));
    }

    #[test]
    fn test_parse_known_actions() {
        for (raw, action) in [
            ("signup", EmailAction::Confirmation),
            ("invite", EmailAction::Invite),
            ("recovery", EmailAction::Recovery),
            ("magiclink", EmailAction::MagicLink),
            ("email_change", EmailAction::EmailChange),
            ("email_changed", EmailAction::EmailChangedNotice),
            ("password_changed", EmailAction::PasswordChangedNotice),
        ] {
            assert_eq!(EmailAction::parse(raw), Some(action));
            assert_eq!(action.as_str(), raw);
        }
        assert_eq!(EmailAction::parse("reauthentication"), None);
    }

    #[test]
    fn test_event_parse_unknown_action() {
        let body = br#"{"user":{"email":"a@b.c"},"email":{"email_action_type":"teleport","token_hash":"h"}}"#;
        let err = EmailEvent::parse(body).unwrap_err();
        assert!(matches!(err, WebhookError::UnknownAction(_)));
        assert!(!err.is_auth_error());
    }

    #[test]
    fn test_event_parse_malformed_payload() {
        let err = EmailEvent::parse(b"not json").unwrap_err();
        assert!(matches!(err, WebhookError::MalformedPayload(_)));
    }

    #[test]
    fn test_build_email_with_verification_link() {
        let body = br#"{"user":{"email":"a@b.c"},"email":{"email_action_type":"recovery","token_hash":"th123","redirect_to":"https://spaces.example.com/room"}}"#;
        let (event, action) = EmailEvent::parse(body).unwrap();

        let email = build_email(action, &event, "https://spaces.example.com");
        assert_eq!(email.to, "a@b.c");
        assert_eq!(email.subject, "Reset your password");
        assert!(email.html.contains("token_hash=th123"));
        assert!(email.html.contains("type=recovery"));
        assert!(email.html.contains("redirect_to=https%3A%2F%2Fspaces.example.com%2Froom"));
    }

    #[test]
    fn test_build_notice_email_has_no_link() {
        let body = br#"{"user":{"email":"a@b.c"},"email":{"email_action_type":"password_changed"}}"#;
        let (event, action) = EmailEvent::parse(body).unwrap();

        let email = build_email(action, &event, "https://spaces.example.com");
        assert_eq!(email.subject, "Your password was changed");
        assert!(!email.html.contains("<a href"));
    }
}
