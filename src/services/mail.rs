// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Daily motivation email.

use crate::config::MailSettings;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;

pub const SUBJECT: &str = "Daily Motivation";
/// Content-ID the HTML body references for the inline image
pub const IMAGE_CID: &str = "generated_image";

/// Outgoing message with one inline image.
#[derive(Debug, Clone, PartialEq)]
pub struct MotivationEmail {
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub image: Vec<u8>,
    pub image_filename: String,
}

impl MotivationEmail {
    pub fn new(to: &str, image: Vec<u8>, image_filename: &str) -> Self {
        Self {
            to: to.to_string(),
            subject: SUBJECT.to_string(),
            html_body: html_body(),
            image,
            image_filename: image_filename.to_string(),
        }
    }
}

fn html_body() -> String {
    format!(
        r#"<html>
  <head></head>
  <body style="font-family: Arial, sans-serif; text-align: center; padding: 20px;">
    <h1 style="color: #646cff;">{subject}</h1>
    <p style="font-size: 24px; font-weight: bold; margin: 30px 0;">Get after it</p>
    <div style="margin: 30px 0;">
      <img src="cid:{cid}" style="max-width: 600px; border-radius: 8px;" alt="Your Motivational Image">
    </div>
    <footer style="margin-top: 50px; padding-top: 20px; border-top: 1px solid #ccc; color: #666;">
      <p>Powered by <a href="https://motiv8.ai" style="color: #646cff; text-decoration: none;">motiv8.ai</a></p>
    </footer>
  </body>
</html>
"#,
        subject = SUBJECT,
        cid = IMAGE_CID
    )
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &MotivationEmail) -> Result<()>;
}

/// Sends through a transactional mail HTTP API.
///
/// Without [`MailSettings`] every send fails, so deliveries are recorded as
/// failed rather than silently skipped.
#[derive(Clone)]
pub struct HttpMailer {
    http: reqwest::Client,
    settings: Option<MailSettings>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
    attachments: [Attachment<'a>; 1],
}

#[derive(Serialize)]
struct Attachment<'a> {
    filename: &'a str,
    content: String,
    content_type: &'static str,
    content_id: &'static str,
    disposition: &'static str,
}

impl HttpMailer {
    pub fn new(settings: Option<MailSettings>) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: &MotivationEmail) -> Result<()> {
        let settings = self
            .settings
            .as_ref()
            .ok_or_else(|| AppError::Mail("mail not configured".to_string()))?;

        let request = SendRequest {
            from: &settings.from,
            to: [&email.to],
            subject: &email.subject,
            html: &email.html_body,
            attachments: [Attachment {
                filename: &email.image_filename,
                content: BASE64.encode(&email.image),
                content_type: "image/png",
                content_id: IMAGE_CID,
                disposition: "inline",
            }],
        };

        let response = self
            .http
            .post(&settings.api_url)
            .bearer_auth(&settings.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Mail(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Mail(format!("HTTP {}: {}", status, body)));
        }

        tracing::info!("Motivation email sent");
        Ok(())
    }
}
