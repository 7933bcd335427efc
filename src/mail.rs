use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use std::{env::consts::EXE_SUFFIX, str::FromStr};

use lettre::{
    message::{Mailbox, Message, MultiPart},
    transport::smtp::authentication::{Credentials, Mechanism as SmtpAuthMechanism},
    transport::smtp::client::{Tls, TlsParameters},
    transport::smtp::extension::ClientId,
    Address, AsyncSendmailTransport, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};

use crate::{api::EmptyResult, error::Error, CONFIG};

fn sendmail_transport() -> AsyncSendmailTransport<Tokio1Executor> {
    if let Some(command) = CONFIG.sendmail_command() {
        AsyncSendmailTransport::new_with_command(command)
    } else {
        AsyncSendmailTransport::new_with_command(format!("sendmail{EXE_SUFFIX}"))
    }
}

fn smtp_transport() -> AsyncSmtpTransport<Tokio1Executor> {
    use std::time::Duration;
    let host = CONFIG.smtp_host().unwrap();

    let smtp_client = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str())
        .port(CONFIG.smtp_port())
        .timeout(Some(Duration::from_secs(CONFIG.smtp_timeout())));

    // Determine security
    let smtp_client = if CONFIG.smtp_security() != *"off" {
        let mut tls_parameters = TlsParameters::builder(host);
        if CONFIG.smtp_accept_invalid_hostnames() {
            tls_parameters = tls_parameters.dangerous_accept_invalid_hostnames(true);
        }
        if CONFIG.smtp_accept_invalid_certs() {
            tls_parameters = tls_parameters.dangerous_accept_invalid_certs(true);
        }
        let tls_parameters = tls_parameters.build().unwrap();

        if CONFIG.smtp_security() == *"force_tls" {
            smtp_client.tls(Tls::Wrapper(tls_parameters))
        } else {
            smtp_client.tls(Tls::Required(tls_parameters))
        }
    } else {
        smtp_client
    };

    let smtp_client = match (CONFIG.smtp_username(), CONFIG.smtp_password()) {
        (Some(user), Some(pass)) => smtp_client.credentials(Credentials::new(user, pass)),
        _ => smtp_client,
    };

    let smtp_client = match CONFIG.helo_name() {
        Some(helo_name) => smtp_client.hello_name(ClientId::Domain(helo_name)),
        None => smtp_client,
    };

    let smtp_client = match CONFIG.smtp_auth_mechanism() {
        Some(mechanism) => {
            let allowed_mechanisms = [SmtpAuthMechanism::Plain, SmtpAuthMechanism::Login, SmtpAuthMechanism::Xoauth2];
            let mut selected_mechanisms = vec![];
            for wanted_mechanism in mechanism.split(',') {
                for m in &allowed_mechanisms {
                    if m.to_string().to_lowercase()
                        == wanted_mechanism.trim_matches(|c| c == '"' || c == '\'' || c == ' ').to_lowercase()
                    {
                        selected_mechanisms.push(*m);
                    }
                }
            }

            if !selected_mechanisms.is_empty() {
                smtp_client.authentication(selected_mechanisms)
            } else {
                // Only show a warning, and return without setting an actual authentication mechanism
                warn!("No valid SMTP Auth mechanism found for '{mechanism}', using default values");
                smtp_client
            }
        }
        _ => smtp_client,
    };

    smtp_client.build()
}

// This will sanitize the string values by stripping all the html tags to prevent XSS and HTML Injections
fn sanitize_data(data: &mut serde_json::Value) {
    use regex::Regex;
    use std::sync::LazyLock;
    static RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());

    match data {
        serde_json::Value::String(s) => *s = RE.replace_all(s, "").to_string(),
        serde_json::Value::Object(obj) => {
            for d in obj.values_mut() {
                sanitize_data(d);
            }
        }
        serde_json::Value::Array(arr) => {
            for d in arr.iter_mut() {
                sanitize_data(d);
            }
        }
        _ => {}
    }
}

fn get_text(template_name: &'static str, data: serde_json::Value) -> Result<(String, String, String), Error> {
    let mut data = data;
    sanitize_data(&mut data);
    let (subject_html, body_html) = get_template(&format!("{template_name}.html"), &data)?;
    let (_subject_text, body_text) = get_template(template_name, &data)?;
    Ok((subject_html, body_html, body_text))
}

fn get_template(template_name: &str, data: &serde_json::Value) -> Result<(String, String), Error> {
    let text = CONFIG.render_template(template_name, data)?;
    let mut text_split = text.split("<!---------------->");

    let subject = match text_split.next() {
        Some(s) => s.trim().to_string(),
        None => err!("Template doesn't contain subject"),
    };

    let body = match text_split.next() {
        Some(s) => s.trim().to_string(),
        None => err!("Template doesn't contain body"),
    };

    if text_split.next().is_some() {
        err!("Template contains more than one body");
    }

    Ok((subject, body))
}

pub async fn send_signup_confirmation(
    address: &str,
    user_name: &str,
    event_title: &str,
    role_name: &str,
    event_date: &str,
    event_time: &str,
) -> EmptyResult {
    let (subject, body_html, body_text) = get_text(
        "email/signup_confirmation",
        json!({
            "url": CONFIG.domain(),
            "user_name": user_name,
            "event_title": event_title,
            "role_name": role_name,
            "event_date": event_date,
            "event_time": event_time,
        }),
    )?;

    send_email(address, &subject, body_html, body_text).await
}

pub async fn send_registration_cancelled(
    address: &str,
    user_name: &str,
    event_title: &str,
    role_name: &str,
) -> EmptyResult {
    let (subject, body_html, body_text) = get_text(
        "email/registration_cancelled",
        json!({
            "url": CONFIG.domain(),
            "user_name": user_name,
            "event_title": event_title,
            "role_name": role_name,
        }),
    )?;

    send_email(address, &subject, body_html, body_text).await
}

pub async fn send_removed_from_role(address: &str, user_name: &str, event_title: &str, role_name: &str) -> EmptyResult {
    let (subject, body_html, body_text) = get_text(
        "email/removed_from_role",
        json!({
            "url": CONFIG.domain(),
            "user_name": user_name,
            "event_title": event_title,
            "role_name": role_name,
        }),
    )?;

    send_email(address, &subject, body_html, body_text).await
}

/// The invitation mail of the assign flow; carries the decline link built
/// from the short-lived rejection token.
pub async fn send_role_invitation(
    address: &str,
    user_name: &str,
    event_title: &str,
    role_name: &str,
    event_date: &str,
    event_time: &str,
    decline_token: &str,
) -> EmptyResult {
    let decline_url = format!(
        "{}/registrations/decline?token={}",
        CONFIG.domain(),
        percent_encode(decline_token.as_bytes(), NON_ALPHANUMERIC)
    );

    let (subject, body_html, body_text) = get_text(
        "email/role_invitation",
        json!({
            "url": CONFIG.domain(),
            "user_name": user_name,
            "event_title": event_title,
            "role_name": role_name,
            "event_date": event_date,
            "event_time": event_time,
            "decline_url": decline_url,
        }),
    )?;

    send_email(address, &subject, body_html, body_text).await
}

pub async fn send_event_updated(address: &str, event_title: &str, event_date: &str, event_time: &str) -> EmptyResult {
    let (subject, body_html, body_text) = get_text(
        "email/event_updated",
        json!({
            "url": CONFIG.domain(),
            "event_title": event_title,
            "event_date": event_date,
            "event_time": event_time,
        }),
    )?;

    send_email(address, &subject, body_html, body_text).await
}

pub async fn send_co_organizer_added(address: &str, user_name: &str, event_title: &str, added_by: &str) -> EmptyResult {
    let (subject, body_html, body_text) = get_text(
        "email/co_organizer_added",
        json!({
            "url": CONFIG.domain(),
            "user_name": user_name,
            "event_title": event_title,
            "added_by": added_by,
        }),
    )?;

    send_email(address, &subject, body_html, body_text).await
}

pub async fn send_event_auto_unpublished(address: &str, event_title: &str, missing_fields: &[&str]) -> EmptyResult {
    let (subject, body_html, body_text) = get_text(
        "email/event_auto_unpublished",
        json!({
            "url": CONFIG.domain(),
            "event_title": event_title,
            "missing_fields": missing_fields.join(", "),
        }),
    )?;

    send_email(address, &subject, body_html, body_text).await
}

async fn send_with_selected_transport(email: Message) -> EmptyResult {
    if CONFIG.use_sendmail() {
        match sendmail_transport().send(email).await {
            Ok(_) => Ok(()),
            // Match some common errors and make them more user friendly
            Err(e) => {
                if e.is_client() {
                    debug!("Sendmail client error: {e:?}");
                    err!(format!("Sendmail client error: {e}"));
                } else if e.is_response() {
                    debug!("Sendmail response error: {e:?}");
                    err!(format!("Sendmail response error: {e}"));
                } else {
                    debug!("Sendmail error: {e:?}");
                    err!(format!("Sendmail error: {e}"));
                }
            }
        }
    } else {
        match smtp_transport().send(email).await {
            Ok(_) => Ok(()),
            // Match some common errors and make them more user friendly
            Err(e) => {
                if e.is_client() {
                    debug!("SMTP client error: {e:#?}");
                    err!(format!("SMTP client error: {e}"));
                } else if e.is_transient() {
                    debug!("SMTP 4xx error: {e:#?}");
                    err!(format!("SMTP 4xx error: {e}"));
                } else if e.is_permanent() {
                    debug!("SMTP 5xx error: {e:#?}");
                    let mut msg = e.to_string();
                    // Add a special check for 535 to add a more descriptive message
                    if msg.contains("(535)") {
                        msg = format!("{msg} - Authentication credentials invalid");
                    }
                    err!(format!("SMTP 5xx error: {msg}"));
                } else if e.is_timeout() {
                    debug!("SMTP timeout error: {e:#?}");
                    err!(format!("SMTP timeout error: {e}"));
                } else if e.is_tls() {
                    debug!("SMTP encryption error: {e:#?}");
                    err!(format!("SMTP encryption error: {e}"));
                } else {
                    debug!("SMTP error: {e:#?}");
                    err!(format!("SMTP error: {e}"));
                }
            }
        }
    }
}

async fn send_email(address: &str, subject: &str, body_html: String, body_text: String) -> EmptyResult {
    let smtp_from = Address::from_str(&CONFIG.smtp_from())?;

    let body = MultiPart::alternative_plain_html(body_text, body_html);

    let email = Message::builder()
        .message_id(Some(format!("<{}@{}>", crate::util::get_uuid(), smtp_from.domain())))
        .to(Mailbox::new(None, Address::from_str(address)?))
        .from(Mailbox::new(Some(CONFIG.smtp_from_name()), smtp_from))
        .subject(subject)
        .multipart(body)?;

    send_with_selected_transport(email).await
}
