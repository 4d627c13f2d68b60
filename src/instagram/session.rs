use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Opaque authenticated state of the story source
///
/// Every source call hands back the state it ended with; callers merge it and
/// persist it through [`SessionStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some() && self.cookies.contains_key("sessionid")
    }

    /// Fold newer state into this one; newer cookies win
    pub fn merge(&mut self, newer: Session) {
        if newer.user_id.is_some() {
            self.user_id = newer.user_id;
        }
        self.cookies.extend(newer.cookies);
    }

    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        Some(pairs.join("; "))
    }

    /// Record every `Set-Cookie` of a response
    pub fn absorb_set_cookie(&mut self, headers: &HeaderMap) {
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            let pair = raw.split(';').next().unwrap_or_default();
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim().trim_matches('"'));
            if name.is_empty() {
                continue;
            }
            if value.is_empty() {
                self.cookies.remove(name);
            } else {
                self.cookies.insert(name.to_string(), value.to_string());
            }
        }
    }
}

/// A source call's result plus the session state after the call
#[derive(Debug, Clone)]
pub struct Reply<T> {
    pub value: T,
    pub session: Session,
}

/// JSON file holding the last known session
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved session, or an empty one when the file is missing or unreadable
    pub async fn load(&self) -> Session {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Session::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read saved session");
                return Session::default();
            }
        };

        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "Ignoring corrupt saved session");
            Session::default()
        })
    }

    pub async fn save(&self, session: &Session) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(session).map_err(io::Error::other)?;
        tokio::fs::write(&self.path, json).await?;
        debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    /// Run `f` with the saved session and persist whatever session it hands back,
    /// whether `f` succeeded or not
    pub async fn scoped<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = (Session, Result<T, E>)>,
    {
        let saved = self.load().await;
        let (session, result) = f(saved).await;
        if let Err(e) = self.save(&session).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist session");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use tempfile::TempDir;

    #[test]
    fn test_absorb_set_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("sessionid=abc; Path=/; HttpOnly"));
        headers.append(SET_COOKIE, HeaderValue::from_static("csrftoken=\"xyz\"; Max-Age=100"));

        let mut session = Session::default();
        session.cookies.insert("stale".into(), "1".into());
        session.absorb_set_cookie(&headers);

        assert_eq!(session.cookies["sessionid"], "abc");
        assert_eq!(session.cookies["csrftoken"], "xyz");

        let mut clearing = HeaderMap::new();
        clearing.append(SET_COOKIE, HeaderValue::from_static("stale=; Max-Age=0"));
        session.absorb_set_cookie(&clearing);
        assert!(!session.cookies.contains_key("stale"));
        assert_eq!(session.cookie_header().unwrap(), "csrftoken=xyz; sessionid=abc");
    }

    #[test]
    fn test_merge_prefers_newer() {
        let mut base = Session {
            user_id: Some("1".into()),
            cookies: BTreeMap::from([("a".to_string(), "old".to_string())]),
        };
        base.merge(Session {
            user_id: None,
            cookies: BTreeMap::from([("a".to_string(), "new".to_string()), ("b".to_string(), "2".to_string())]),
        });

        assert_eq!(base.user_id.as_deref(), Some("1"));
        assert_eq!(base.cookies["a"], "new");
        assert_eq!(base.cookies["b"], "2");
    }

    #[tokio::test]
    async fn test_scoped_saves_on_error() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path().join("nested/session.json"));
        assert_eq!(store.load().await, Session::default());

        let result: Result<(), String> = store
            .scoped(|mut session| async move {
                session.cookies.insert("sessionid".into(), "kept".into());
                (session, Err("boom".to_string()))
            })
            .await;
        assert_eq!(result.unwrap_err(), "boom");

        let reloaded = store.load().await;
        assert_eq!(reloaded.cookies["sessionid"], "kept");
    }

    #[tokio::test]
    async fn test_corrupt_file_yields_empty_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = SessionStore::new(path);
        assert_eq!(store.load().await, Session::default());
    }
}
