use crate::driver::CallKind;
use crate::store::write_atomic;
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// One API credential and its credit budget for this wallet.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    /// The secret. Lives in memory only; persisted state carries a hint.
    token: String,
    pub remaining: u32,
    pub limit: u32,
    pub banned: bool,
    pub last_error: Option<String>,
    pub last_used_at: Option<u64>,
}

impl Credential {
    /// Redacted form for logs and persisted state: first 10 chars + last 4.
    pub fn token_hint(&self) -> String {
        token_hint(&self.token)
    }

    pub fn short_id(&self) -> String {
        self.id.chars().take(8).collect()
    }
}

fn token_hint(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 14 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..10].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}…{tail}")
}

/// A live credit reservation. Consumed by exactly one of
/// [`Wallet::commit`], [`Wallet::refund`], or [`Wallet::retire`].
#[derive(Debug)]
pub struct Reservation {
    pub credential_id: String,
    pub token: String,
    pub short_id: String,
    pub reserved: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub active: usize,
    pub banned: usize,
    pub total_remaining: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCredential {
    id: String,
    token_hint: String,
    remaining: u32,
    limit: u32,
    banned: bool,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    last_used_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedWallet {
    per_credential_limit: u32,
    credentials: Vec<PersistedCredential>,
}

struct WalletInner {
    credentials: Vec<Credential>,
    state_path: PathBuf,
    per_credential_limit: u32,
}

/// Persisted pool of credentials. All operations are serialized behind one
/// mutex and every credit change is followed by an atomic rewrite of the
/// state file (single-writer: the process holds an exclusive lock beside it).
pub struct Wallet {
    inner: Mutex<WalletInner>,
}

impl Wallet {
    /// Sibling state file: `<seed stem>.state.json`.
    pub fn state_path_for(seed_path: &Path) -> PathBuf {
        seed_path.with_extension("state.json")
    }

    /// Load the wallet: seed tokens from the plain token file (array of
    /// strings or `id → token` object), then overlay remaining/ban state
    /// from the persisted file if one exists.
    ///
    /// If the seed is absent but persisted state exists, the run proceeds
    /// with the persisted credit state and empty tokens; calls then classify
    /// as auth failures and the credentials retire. Secrets are never
    /// written to disk by this process.
    pub fn load(seed_path: &Path, per_credential_limit: u32) -> Result<Self> {
        let state_path = Self::state_path_for(seed_path);

        let seeds = match fs::read_to_string(seed_path) {
            Ok(raw) => parse_seed(&raw)
                .wrap_err_with(|| format!("failed to parse credentials file {}", seed_path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(eyre!(
                    "failed to read credentials file {}: {err}",
                    seed_path.display()
                ))
            }
        };

        let persisted: Option<PersistedWallet> = match fs::read_to_string(&state_path) {
            Ok(raw) => Some(serde_json::from_str(&raw).wrap_err_with(|| {
                format!("failed to parse wallet state file {}", state_path.display())
            })?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(eyre!(
                    "failed to read wallet state file {}: {err}",
                    state_path.display()
                ))
            }
        };

        if seeds.is_empty() && persisted.is_none() {
            return Err(eyre!(
                "no credentials: {} is missing or empty and no state file exists",
                seed_path.display()
            ));
        }

        let mut credentials: Vec<Credential> = Vec::new();

        if seeds.is_empty() {
            // Seed gone; run on persisted entries alone. The tokens cannot be
            // recovered from hints, so every call will fail auth and retire.
            tracing::warn!(
                state = %state_path.display(),
                "credentials seed file missing; proceeding with persisted state only (tokens unavailable)"
            );
            if let Some(persisted) = &persisted {
                for p in &persisted.credentials {
                    credentials.push(Credential {
                        id: p.id.clone(),
                        token: String::new(),
                        remaining: p.remaining,
                        limit: p.limit,
                        banned: p.banned,
                        last_error: p.last_error.clone(),
                        last_used_at: p.last_used_at,
                    });
                }
            }
        } else {
            for (id, token) in seeds {
                let prior = persisted
                    .as_ref()
                    .and_then(|p| p.credentials.iter().find(|c| c.id == id));
                credentials.push(match prior {
                    Some(p) => Credential {
                        id,
                        token,
                        remaining: p.remaining,
                        limit: p.limit,
                        banned: p.banned,
                        last_error: p.last_error.clone(),
                        last_used_at: p.last_used_at,
                    },
                    None => Credential {
                        id,
                        token,
                        remaining: per_credential_limit,
                        limit: per_credential_limit,
                        banned: false,
                        last_error: None,
                        last_used_at: None,
                    },
                });
            }
        }

        let inner = WalletInner {
            credentials,
            state_path,
            per_credential_limit,
        };
        inner.persist()?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Reserve `need` credits. Prefers the smallest non-banned credential
    /// whose `remaining >= need` (packs quota efficiently); falls back to the
    /// non-banned credential with the largest positive `remaining`, reserving
    /// what it has. `None` when no non-banned credential has credit left.
    pub async fn reserve(&self, need: u32) -> Result<Option<Reservation>> {
        let mut inner = self.inner.lock().await;

        let pick = {
            let fits = inner
                .credentials
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.banned && c.remaining >= need.max(1))
                .min_by_key(|(_, c)| c.remaining)
                .map(|(i, _)| i);
            match fits {
                Some(i) => Some(i),
                None => inner
                    .credentials
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.banned && c.remaining > 0)
                    .max_by_key(|(_, c)| c.remaining)
                    .map(|(i, _)| i),
            }
        };

        let Some(i) = pick else {
            return Ok(None);
        };

        let reserved = need.max(1).min(inner.credentials[i].remaining);
        inner.credentials[i].remaining -= reserved;
        let reservation = Reservation {
            credential_id: inner.credentials[i].id.clone(),
            token: inner.credentials[i].token.clone(),
            short_id: inner.credentials[i].short_id(),
            reserved,
        };
        inner.persist()?;
        Ok(Some(reservation))
    }

    /// Finalize a successful call. The reservation was already debited;
    /// apply the signed correction `cost_actual − reserved` so the ledger
    /// tracks what the remote actually consumed.
    pub async fn commit(&self, reservation: Reservation, cost_actual: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let cred = inner.credential_mut(&reservation.credential_id)?;
        let corrected = i64::from(cred.remaining) + i64::from(reservation.reserved)
            - i64::from(cost_actual);
        cred.remaining = corrected.clamp(0, i64::from(cred.limit)) as u32;
        cred.last_used_at = Some(now_unix());
        inner.persist()
    }

    /// Return the reserved credits untouched (the call never consumed them).
    pub async fn refund(&self, reservation: Reservation) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let cred = inner.credential_mut(&reservation.credential_id)?;
        cred.remaining = cred
            .remaining
            .saturating_add(reservation.reserved)
            .min(cred.limit);
        inner.persist()
    }

    /// Permanently ban the credential for this run: refund the outstanding
    /// reservation (net credit change zero), zero it out, record the cause.
    pub async fn retire(
        &self,
        reservation: Reservation,
        kind: CallKind,
        message: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let cred = inner.credential_mut(&reservation.credential_id)?;
        cred.banned = true;
        cred.remaining = 0;
        cred.last_used_at = Some(now_unix());
        cred.last_error = Some(truncate_reason(&format!(
            "{}: {message}",
            serde_json::to_string(&kind)
                .unwrap_or_else(|_| "unknown".into())
                .trim_matches('"')
        )));
        tracing::warn!(
            credential = %cred.token_hint(),
            kind = ?kind,
            message,
            "credential retired"
        );
        inner.persist()
    }

    pub async fn snapshot(&self) -> WalletSnapshot {
        let inner = self.inner.lock().await;
        let banned = inner.credentials.iter().filter(|c| c.banned).count();
        WalletSnapshot {
            active: inner.credentials.len() - banned,
            banned,
            total_remaining: inner
                .credentials
                .iter()
                .filter(|c| !c.banned)
                .map(|c| u64::from(c.remaining))
                .sum(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn credentials_for_test(&self) -> Vec<Credential> {
        self.inner.lock().await.credentials.clone()
    }
}

impl WalletInner {
    fn credential_mut(&mut self, id: &str) -> Result<&mut Credential> {
        self.credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| eyre!("unknown credential id {id}"))
    }

    fn persist(&self) -> Result<()> {
        let persisted = PersistedWallet {
            per_credential_limit: self.per_credential_limit,
            credentials: self
                .credentials
                .iter()
                .map(|c| PersistedCredential {
                    id: c.id.clone(),
                    token_hint: c.token_hint(),
                    remaining: c.remaining,
                    limit: c.limit,
                    banned: c.banned,
                    last_error: c.last_error.clone(),
                    last_used_at: c.last_used_at,
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&persisted)
            .wrap_err("failed to serialize wallet state")?;
        write_atomic(&self.state_path, &json)
    }
}

/// Accepted seed shapes: a JSON array of token strings (ids are "1", "2",
/// ...) or an object mapping `id → token`.
fn parse_seed(raw: &str) -> Result<Vec<(String, String)>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| match v {
                serde_json::Value::String(token) => Ok(((i + 1).to_string(), token)),
                other => Err(eyre!("expected token string at index {i}, got {other}")),
            })
            .collect(),
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(id, v)| match v {
                serde_json::Value::String(token) => Ok((id, token)),
                other => Err(eyre!("expected token string for id {id}, got {other}")),
            })
            .collect(),
        other => Err(eyre!(
            "credentials seed must be an array of strings or an id → token object, got {other}"
        )),
    }
}

fn truncate_reason(reason: &str) -> String {
    const MAX: usize = 240;
    let mut out: String = reason.chars().take(MAX).collect();
    if out.len() < reason.len() {
        out.push_str("...");
    }
    out
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_file(content: &str) -> tempfile::NamedTempFile {
        let f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        fs::write(f.path(), content).unwrap();
        f
    }

    #[tokio::test]
    async fn seeds_from_array_and_object() {
        let f = seed_file(r#"["tok-aaaaaaaaaaaaaaaa","tok-bbbbbbbbbbbbbbbb"]"#);
        let wallet = Wallet::load(f.path(), 100).unwrap();
        let creds = wallet.credentials_for_test().await;
        assert_eq!(creds.len(), 2);
        assert_eq!(creds[0].id, "1");
        assert_eq!(creds[0].remaining, 100);
        assert!(!creds[0].banned);

        let f = seed_file(r#"{"main":"tok-cccccccccccccccc"}"#);
        let wallet = Wallet::load(f.path(), 50).unwrap();
        let creds = wallet.credentials_for_test().await;
        assert_eq!(creds[0].id, "main");
        assert_eq!(creds[0].limit, 50);
    }

    #[tokio::test]
    async fn persisted_state_overlays_seed() {
        let f = seed_file(r#"["tok-aaaaaaaaaaaaaaaa","tok-bbbbbbbbbbbbbbbb"]"#);
        {
            let wallet = Wallet::load(f.path(), 100).unwrap();
            let res = wallet.reserve(10).await.unwrap().unwrap();
            wallet.commit(res, 10).await.unwrap();
        }
        // Second run: remaining survives, tokens come from the seed again.
        let wallet = Wallet::load(f.path(), 100).unwrap();
        let creds = wallet.credentials_for_test().await;
        assert_eq!(creds.iter().map(|c| c.remaining).sum::<u32>(), 190);

        let state_raw =
            fs::read_to_string(Wallet::state_path_for(f.path())).unwrap();
        // Secrets never land on disk.
        assert!(!state_raw.contains("tok-aaaaaaaaaaaaaaaa"));
        assert!(state_raw.contains("tokenHint"));
    }

    #[tokio::test]
    async fn reserve_prefers_smallest_fit_then_largest_remainder() {
        let f = seed_file(r#"{"a":"tok-aaaaaaaaaaaaaaaa","b":"tok-bbbbbbbbbbbbbbbb"}"#);
        let wallet = Wallet::load(f.path(), 100).unwrap();

        // Drain "a" down to 5 so it no longer fits need=10.
        let res = wallet.reserve(10).await.unwrap().unwrap();
        assert_eq!(res.credential_id, "a");
        wallet.commit(res, 95).await.unwrap();

        // Smallest fit is now "b" (100) since a=5 < 10.
        let res = wallet.reserve(10).await.unwrap().unwrap();
        assert_eq!(res.credential_id, "b");
        wallet.refund(res).await.unwrap();

        // Exhaust b, then need=10 falls back to a's 5 remaining.
        let res = wallet.reserve(100).await.unwrap().unwrap();
        assert_eq!(res.credential_id, "b");
        wallet.commit(res, 100).await.unwrap();

        let res = wallet.reserve(10).await.unwrap().unwrap();
        assert_eq!(res.credential_id, "a");
        assert_eq!(res.reserved, 5);
        wallet.refund(res).await.unwrap();
    }

    #[tokio::test]
    async fn reserve_returns_none_when_all_banned_or_empty() {
        let f = seed_file(r#"{"a":"tok-aaaaaaaaaaaaaaaa"}"#);
        let wallet = Wallet::load(f.path(), 10).unwrap();
        let res = wallet.reserve(1).await.unwrap().unwrap();
        wallet
            .retire(res, CallKind::AuthInvalid, "401 unauthorized")
            .await
            .unwrap();
        assert!(wallet.reserve(1).await.unwrap().is_none());

        let snap = wallet.snapshot().await;
        assert_eq!(snap.banned, 1);
        assert_eq!(snap.active, 0);
        assert_eq!(snap.total_remaining, 0);
    }

    #[tokio::test]
    async fn retire_is_net_zero_and_records_cause() {
        let f = seed_file(r#"{"a":"tok-aaaaaaaaaaaaaaaa","b":"tok-bbbbbbbbbbbbbbbb"}"#);
        let wallet = Wallet::load(f.path(), 100).unwrap();
        let before = wallet.snapshot().await.total_remaining;

        let res = wallet.reserve(10).await.unwrap().unwrap();
        wallet
            .retire(res, CallKind::Billing, "402 payment required")
            .await
            .unwrap();

        let creds = wallet.credentials_for_test().await;
        let retired = creds.iter().find(|c| c.banned).unwrap();
        assert_eq!(retired.remaining, 0);
        assert!(retired.last_error.as_deref().unwrap().contains("billing"));
        // The survivor still has its full quota; only the retired
        // credential's balance left the pool.
        assert_eq!(wallet.snapshot().await.total_remaining, before - 100);
    }

    #[tokio::test]
    async fn commit_applies_signed_correction() {
        let f = seed_file(r#"{"a":"tok-aaaaaaaaaaaaaaaa"}"#);
        let wallet = Wallet::load(f.path(), 100).unwrap();

        // Reserved 10, actually cost 3: 7 comes back.
        let res = wallet.reserve(10).await.unwrap().unwrap();
        wallet.commit(res, 3).await.unwrap();
        assert_eq!(wallet.snapshot().await.total_remaining, 97);

        // Reserved 1, actually cost 4: 3 more leave.
        let res = wallet.reserve(1).await.unwrap().unwrap();
        wallet.commit(res, 4).await.unwrap();
        assert_eq!(wallet.snapshot().await.total_remaining, 93);
    }

    #[tokio::test]
    async fn missing_seed_with_state_proceeds_tokenless() {
        let f = seed_file(r#"{"a":"tok-aaaaaaaaaaaaaaaa"}"#);
        let state_path = Wallet::state_path_for(f.path());
        {
            let _wallet = Wallet::load(f.path(), 100).unwrap();
        }
        assert!(state_path.exists());
        fs::remove_file(f.path()).unwrap();

        let wallet = Wallet::load(f.path(), 100).unwrap();
        let creds = wallet.credentials_for_test().await;
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].remaining, 100);
        // Token could not be recovered; reserve still works, auth will fail
        // downstream and retire the credential.
        let res = wallet.reserve(1).await.unwrap().unwrap();
        assert!(res.token.is_empty());
    }

    #[test]
    fn token_hint_redacts_middle() {
        assert_eq!(token_hint("0123456789abcdefXYZ9"), "0123456789…XYZ9");
        assert_eq!(token_hint("short"), "*****");
    }
}
