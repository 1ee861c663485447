//! Caller authentication for the automation API.
//!
//! Two credentials are accepted:
//! - the shared cron secret, from `x-cron-key`, `?key=` or `Authorization: Bearer`;
//! - an owner token (bearer), looked up by its SHA-256 digest.
//!
//! With no secret configured, only owner tokens can authenticate.

use axum::http::HeaderMap;
use flowpost_core::Result;
use flowpost_scheduler::SchedulerDb;

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Holder of the shared secret: may act for any owner.
    Secret,
    /// Holder of an owner token: may only touch that owner's data.
    Owner(String),
}

impl Caller {
    pub fn is_secret(&self) -> bool {
        matches!(self, Caller::Secret)
    }

    pub fn can_act_for(&self, owner_id: &str) -> bool {
        match self {
            Caller::Secret => true,
            Caller::Owner(own) => own == owner_id,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Caller::Secret => "secret".into(),
            Caller::Owner(id) => format!("owner:{id}"),
        }
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn query_key(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("key="))
        .filter(|k| !k.is_empty())
}

/// Every secret candidate the request presents.
fn presented_secrets<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Vec<&'a str> {
    let header = headers
        .get("x-cron-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    [header, query_key(query), bearer(headers)]
        .into_iter()
        .flatten()
        .collect()
}

/// Resolve the caller, or `None` when no credential checks out.
pub fn authenticate(
    secret: Option<&str>,
    db: &SchedulerDb,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<Option<Caller>> {
    if let Some(secret) = secret
        && presented_secrets(headers, query).contains(&secret)
    {
        return Ok(Some(Caller::Secret));
    }
    match bearer(headers) {
        Some(token) => Ok(db.owner_for_token(token)?.map(Caller::Owner)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use chrono::Utc;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn test_secret_from_each_source() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let s = Some("s3cret");

        let via_header = headers(&[("x-cron-key", "s3cret")]);
        assert_eq!(authenticate(s, &db, &via_header, None).unwrap(), Some(Caller::Secret));

        let none = HeaderMap::new();
        assert_eq!(
            authenticate(s, &db, &none, Some("a=1&key=s3cret")).unwrap(),
            Some(Caller::Secret)
        );

        let via_bearer = headers(&[("authorization", "Bearer s3cret")]);
        assert_eq!(authenticate(s, &db, &via_bearer, None).unwrap(), Some(Caller::Secret));

        let wrong = headers(&[("x-cron-key", "nope")]);
        assert_eq!(authenticate(s, &db, &wrong, None).unwrap(), None);
    }

    #[test]
    fn test_no_secret_configured_rejects_secret_attempts() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let h = headers(&[("x-cron-key", "")]);
        assert_eq!(authenticate(None, &db, &h, Some("key=")).unwrap(), None);
    }

    #[test]
    fn test_owner_token() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let token = db.issue_owner_token("u7", "test", Utc::now()).unwrap();
        let h = headers(&[("authorization", &format!("Bearer {token}"))]);

        let caller = authenticate(Some("s3cret"), &db, &h, None).unwrap().unwrap();
        assert_eq!(caller, Caller::Owner("u7".into()));
        assert!(caller.can_act_for("u7"));
        assert!(!caller.can_act_for("u8"));
        assert!(!caller.is_secret());
        assert!(Caller::Secret.can_act_for("anyone"));
    }
}
