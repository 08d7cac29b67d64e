//! `cookies:check` - parse the cookie bundle, probe the session, and print
//! a report. Exits non-zero when the bundle is malformed or the platform
//! rejects the credentials.

use mirrorbird::source::{CookieBundle, GraphqlSourceClient, SourceClient};

use super::CliError;
use crate::config::Config;

pub async fn handle_cookies_check(config: &Config) -> Result<(), CliError> {
    let bundle = match CookieBundle::parse(&config.cookies_json) {
        Ok(bundle) => bundle,
        Err(error) => {
            println!("cookie bundle: INVALID ({error})");
            return Err(error.into());
        }
    };

    println!("cookie bundle: {} cookies", bundle.len());
    println!("domains rewritten to .twitter.com: {}", bundle.rewritten_domains());
    println!("auth pairs: {}", bundle.auth_pairs().len());
    println!(
        "guest token: {}",
        if bundle.guest_token().is_some() { "present" } else { "absent" }
    );

    let client = GraphqlSourceClient::new(bundle, config.web_bearer_token.clone())?;
    let session = client.check_session().await?;
    if session.logged_in {
        println!(
            "session: logged in via {}",
            session.host.as_deref().unwrap_or("unknown host")
        );
        Ok(())
    } else {
        let reason = session.reason.unwrap_or_else(|| "unknown".to_string());
        println!("session: NOT logged in ({reason})");
        Err(format!("session check failed: {reason}").into())
    }
}
