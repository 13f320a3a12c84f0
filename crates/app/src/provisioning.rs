use metrics::counter;
use qbank_access_provider::{IdentityClient, IdentityError, IdentityUser, OutboundEmail};
use tracing::{info, warn};

use crate::router::AppState;

/// Lookup/create surface of the identity directory, split out so the
/// find-or-create race can be exercised without a live server.
#[allow(async_fn_in_trait)]
pub(crate) trait IdentityDirectory {
    async fn find_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError>;
    async fn create_student(&self, email: &str) -> Result<IdentityUser, IdentityError>;
}

impl IdentityDirectory for IdentityClient {
    async fn find_by_email(&self, email: &str) -> Result<Option<IdentityUser>, IdentityError> {
        IdentityClient::find_by_email(self, email).await
    }

    async fn create_student(&self, email: &str) -> Result<IdentityUser, IdentityError> {
        IdentityClient::create_student(self, email).await
    }
}

/// Resolves the directory uid for an email, creating a student account when
/// none exists yet.
///
/// Two concurrent resolutions for the same new email can both miss the
/// lookup; the loser of the creation race retries the lookup exactly once
/// and adopts the winner's account.
pub(crate) async fn resolve_uid<D: IdentityDirectory>(
    directory: &D,
    email: &str,
) -> Result<String, IdentityError> {
    if let Some(user) = directory.find_by_email(email).await? {
        return Ok(user.uid);
    }

    match directory.create_student(email).await {
        Ok(user) => Ok(user.uid),
        Err(IdentityError::AlreadyExists) => match directory.find_by_email(email).await? {
            Some(user) => Ok(user.uid),
            None => Err(IdentityError::AlreadyExists),
        },
        Err(err) => Err(err),
    }
}

/// Sends the one-time welcome email and stamps `welcome_email_sent_at`.
///
/// The entitlement is already committed when this runs, so every failure
/// here is logged and swallowed. The stamp is written last; a crash between
/// send and stamp is accepted as a rare duplicate email.
pub(crate) async fn send_welcome(state: &AppState, uid: &str, email: &str) {
    let return_url = format!(
        "{}/account/setup",
        state.public_base_url().trim_end_matches('/')
    );

    let link = match state.identity().issue_setup_link(email, &return_url).await {
        Ok(link) => link,
        Err(err) => {
            warn!(stage = "welcome", uid, error = %err, "failed to issue credential-setup link");
            counter!("welcome_email_total", "result" => "link_error").increment(1);
            return;
        }
    };

    let html = welcome_email_html(&link);
    let message = OutboundEmail {
        to: email,
        subject: "Your question bank access is ready",
        html: &html,
    };
    if let Err(err) = state.mailer().send(&message).await {
        warn!(stage = "welcome", uid, error = %err, "failed to send welcome email");
        counter!("welcome_email_total", "result" => "send_error").increment(1);
        return;
    }

    match state
        .storage()
        .entitlements()
        .mark_welcome_sent(uid, state.now())
        .await
    {
        Ok(true) => {
            info!(stage = "welcome", uid, "welcome email sent");
            counter!("welcome_email_total", "result" => "sent").increment(1);
        }
        Ok(false) => {
            // Another writer stamped the row between our check and now.
            info!(stage = "welcome", uid, "welcome email already marked sent");
            counter!("welcome_email_total", "result" => "already_sent").increment(1);
        }
        Err(err) => {
            warn!(stage = "welcome", uid, error = %err, "failed to stamp welcome email");
            counter!("welcome_email_total", "result" => "mark_error").increment(1);
        }
    }
}

fn welcome_email_html(setup_link: &str) -> String {
    format!(
        "<p>Welcome! Your access to the question bank is active.</p>\
         <p><a href=\"{setup_link}\">Set your password</a> to sign in. \
         The link is valid for a single use.</p>\
         <p>If you did not purchase this product, you can ignore this email.</p>"
    )
}
