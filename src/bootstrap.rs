//! Restores a captured marketplace session into a fresh, isolated browser
//! context. Nothing here navigates; a session that cannot prove its
//! cookies apply to the target origin fails the job before the browser
//! ever leaves about:blank.

use tracing::{debug, info};

use crate::browser::{BrowserHost, BrowserSession, CookieParam, SameSite};
use crate::models::{PlatformAccount, RawCookie};
use crate::pipeline::ListingError;

const STAGE: &str = "session";

/// Captured cookies arrive in whatever shape the extension of the day
/// produced. Keep the usable ones, in the shape cookie injection accepts.
///
/// Rules, in order:
/// - no name or no value: dropped
/// - sameSite lax/strict map to their CDP spellings, none and
///   no_restriction both mean None, anything else is omitted
/// - an explicit url wins over domain; `__Host-` cookies that arrived with
///   only a domain get an https url built for them, since host-only
///   cookies silently fail to apply when injected with a bare domain
/// - neither url nor domain: dropped
/// - expires and expirationDate are the same field under two names;
///   non-positive stamps mean a session cookie
pub fn normalize_cookies(raw: &[RawCookie]) -> Vec<CookieParam> {
    raw.iter().filter_map(normalize_cookie).collect()
}

fn normalize_cookie(raw: &RawCookie) -> Option<CookieParam> {
    let name = raw.name.as_deref()?.trim();
    if name.is_empty() {
        return None;
    }
    let value = raw.value.as_deref()?;

    let same_site = raw
        .same_site
        .as_deref()
        .and_then(|s| match s.to_ascii_lowercase().as_str() {
            "lax" => Some(SameSite::Lax),
            "strict" => Some(SameSite::Strict),
            "none" | "no_restriction" => Some(SameSite::None),
            _ => None,
        });

    let domain = raw.domain.clone().filter(|d| !d.is_empty());
    let mut url = raw.url.clone().filter(|u| !u.is_empty());
    if url.is_none()
        && name.starts_with("__Host-")
        && let Some(domain) = &domain
    {
        let host = domain.trim_start_matches('.');
        let path = raw.path.as_deref().unwrap_or("/");
        url = Some(format!("https://{}{}", host, path));
    }

    let domain = if url.is_some() { None } else { domain };
    if url.is_none() && domain.is_none() {
        return None;
    }

    let expires = raw
        .expires
        .or(raw.expiration_date)
        .filter(|stamp| *stamp > 0.0);

    Some(CookieParam {
        name: name.to_string(),
        value: value.to_string(),
        url,
        domain,
        path: raw.path.clone(),
        secure: raw.secure,
        http_only: raw.http_only,
        same_site,
        expires,
    })
}

/// Open an isolated context, apply the account's identity, inject its
/// cookies and read them back against `target_url`. The readback is the
/// cheapest possible proof the session will actually authenticate.
pub async fn create_session(
    host: &dyn BrowserHost,
    account: &PlatformAccount,
    target_url: &str,
) -> Result<Box<dyn BrowserSession>, ListingError> {
    let payload = &account.session_payload_encrypted;
    let cookies = normalize_cookies(&payload.cookies);
    if cookies.is_empty() {
        return Err(ListingError::validation(
            STAGE,
            "session payload has no usable cookies",
        ));
    }
    debug!(
        target: "talos.session",
        account = %account.id,
        captured = payload.cookies.len(),
        usable = cookies.len(),
        "normalized session cookies"
    );

    let session = host
        .new_session()
        .await
        .map_err(|err| ListingError::browser(STAGE, err))?;

    match prepare(session.as_ref(), &cookies, payload.user_agent.as_deref(), target_url).await {
        Ok(()) => Ok(session),
        Err(err) => {
            let _ = session.close().await;
            Err(err)
        }
    }
}

async fn prepare(
    session: &dyn BrowserSession,
    cookies: &[CookieParam],
    user_agent: Option<&str>,
    target_url: &str,
) -> Result<(), ListingError> {
    session
        .apply_profile(user_agent)
        .await
        .map_err(|err| ListingError::browser(STAGE, err))?;
    session
        .set_cookies(cookies)
        .await
        .map_err(|err| ListingError::browser(STAGE, err))?;

    let visible = session
        .cookies_for_url(target_url)
        .await
        .map_err(|err| ListingError::browser(STAGE, err))?;
    // Host-only cookies read back with a bare (non dot-prefixed) domain.
    let host_only = visible
        .iter()
        .filter(|cookie| {
            cookie
                .domain
                .as_deref()
                .map(|d| !d.starts_with('.'))
                .unwrap_or(false)
        })
        .count();
    info!(
        target: "talos.session",
        cookies = visible.len(),
        host_only,
        "cookies visible to {}",
        target_url
    );

    if visible.is_empty() {
        return Err(ListingError::validation(
            STAGE,
            format!("no session cookies apply to {}", target_url),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testkit::{FakeHost, FakeSession};
    use crate::models::{Marketplace, SessionPayload};
    use crate::pipeline::ListingErrorKind;
    use uuid::Uuid;

    fn cookie(name: &str, value: &str) -> RawCookie {
        RawCookie {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
            ..RawCookie::default()
        }
    }

    fn account(cookies: Vec<RawCookie>) -> PlatformAccount {
        PlatformAccount {
            id: Uuid::new_v4(),
            marketplace: Marketplace::Mercari,
            session_payload_encrypted: SessionPayload {
                cookies,
                user_agent: Some("Mozilla/5.0 (captured)".to_string()),
            },
        }
    }

    #[test]
    fn drops_cookies_without_name_or_value() {
        let raw = vec![
            RawCookie {
                value: Some("orphan".to_string()),
                domain: Some(".mercari.com".to_string()),
                ..RawCookie::default()
            },
            RawCookie {
                name: Some("no_value".to_string()),
                domain: Some(".mercari.com".to_string()),
                ..RawCookie::default()
            },
            RawCookie {
                domain: Some(".mercari.com".to_string()),
                ..cookie("kept", "1")
            },
        ];
        let normalized = normalize_cookies(&raw);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].name, "kept");
    }

    #[test]
    fn no_restriction_needs_a_scope_to_survive() {
        let unscoped = RawCookie {
            same_site: Some("no_restriction".to_string()),
            ..cookie("tracker", "x")
        };
        assert!(normalize_cookies(&[unscoped]).is_empty());

        let scoped = RawCookie {
            same_site: Some("no_restriction".to_string()),
            url: Some("https://www.mercari.com/".to_string()),
            ..cookie("tracker", "x")
        };
        let normalized = normalize_cookies(&[scoped]);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].same_site, Some(SameSite::None));
    }

    #[test]
    fn same_site_spellings_map_or_drop() {
        let mk = |spelling: &str| RawCookie {
            same_site: Some(spelling.to_string()),
            domain: Some(".mercari.com".to_string()),
            ..cookie("s", "1")
        };
        assert_eq!(
            normalize_cookies(&[mk("lax")])[0].same_site,
            Some(SameSite::Lax)
        );
        assert_eq!(
            normalize_cookies(&[mk("Strict")])[0].same_site,
            Some(SameSite::Strict)
        );
        assert_eq!(
            normalize_cookies(&[mk("none")])[0].same_site,
            Some(SameSite::None)
        );
        assert_eq!(normalize_cookies(&[mk("unspecified")])[0].same_site, None);
    }

    #[test]
    fn host_prefixed_cookie_gets_url_scope() {
        let raw = RawCookie {
            domain: Some("www.mercari.com".to_string()),
            path: Some("/".to_string()),
            secure: Some(true),
            ..cookie("__Host-session", "abc")
        };
        let normalized = normalize_cookies(&[raw]);
        assert_eq!(
            normalized[0].url.as_deref(),
            Some("https://www.mercari.com/")
        );
        assert_eq!(normalized[0].domain, None);
    }

    #[test]
    fn explicit_url_wins_over_domain() {
        let raw = RawCookie {
            domain: Some(".mercari.com".to_string()),
            url: Some("https://www.mercari.com/sell".to_string()),
            ..cookie("pref", "1")
        };
        let normalized = normalize_cookies(&[raw]);
        assert_eq!(
            normalized[0].url.as_deref(),
            Some("https://www.mercari.com/sell")
        );
        assert_eq!(normalized[0].domain, None);
    }

    #[test]
    fn expiration_date_alias_and_session_cookies() {
        let dated = RawCookie {
            domain: Some(".mercari.com".to_string()),
            expiration_date: Some(1999999999.5),
            ..cookie("dated", "1")
        };
        assert_eq!(normalize_cookies(&[dated])[0].expires, Some(1999999999.5));

        let stale = RawCookie {
            domain: Some(".mercari.com".to_string()),
            expires: Some(-1.0),
            ..cookie("stale", "1")
        };
        assert_eq!(normalize_cookies(&[stale])[0].expires, None);
    }

    #[tokio::test]
    async fn empty_payload_fails_before_the_browser() {
        // A host with no sessions to give: reaching it would error with a
        // Browser kind, not Validation.
        let host = FakeHost::new(vec![]);
        let err = create_session(&host, &account(vec![]), "https://www.mercari.com/")
            .await
            .expect_err("no cookies must fail");
        assert_eq!(err.kind(), ListingErrorKind::Validation);
        assert_eq!(err.stage(), "session");
    }

    #[tokio::test]
    async fn foreign_cookies_fail_readback_and_release_the_context() {
        let session = FakeSession::new();
        let host = FakeHost::new(vec![session.clone()]);
        let foreign = RawCookie {
            domain: Some(".example.org".to_string()),
            ..cookie("other_site", "1")
        };

        let err = create_session(&host, &account(vec![foreign]), "https://www.mercari.com/")
            .await
            .expect_err("foreign cookies must fail readback");
        assert_eq!(err.kind(), ListingErrorKind::Validation);
        assert!(session.navigations().is_empty());
        assert_eq!(session.close_count(), 1);
    }

    #[tokio::test]
    async fn matching_cookies_produce_a_ready_session() {
        let session = FakeSession::new();
        let host = FakeHost::new(vec![session.clone()]);
        let good = RawCookie {
            domain: Some(".mercari.com".to_string()),
            ..cookie("_session", "abc123")
        };

        create_session(&host, &account(vec![good]), "https://www.mercari.com/")
            .await
            .expect("session should bootstrap");
        assert_eq!(session.injected_cookies().len(), 1);
        assert_eq!(
            session.user_agent().as_deref(),
            Some("Mozilla/5.0 (captured)")
        );
        assert!(session.navigations().is_empty());
    }
}
