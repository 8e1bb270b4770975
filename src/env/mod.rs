//! # Environment resolver.
//!
//! [`prepare`] materializes the `KEY=VALUE` vector handed to every child
//! from three sources: the supervisor's own environment, the secret store,
//! and the rules in [`EnvConfig`]. Expansion is two-stage:
//!
//! 1. each `vault-replace` variable's `type:path:field` reference is
//!    resolved against the store (one fetch per path, cached per call);
//! 2. each `vault-template` variable is rendered with the expanded
//!    replacements as its scope.
//!
//! Emission is controlled solely by `pass-all` / `pass`: being replaced or
//! templated does not by itself export a variable. Failures name the
//! variable that caused them and abort preparation.

mod template;

pub use template::TemplateError;

use std::collections::{BTreeMap, HashMap};

use crate::config::EnvConfig;
use crate::error::EnvError;
use crate::secrets::{AwsCredential, DatabaseCredential, SecretClient};

/// Resolves the child environment vector from the parent environment.
pub async fn prepare(
    cfg: &EnvConfig,
    client: &dyn SecretClient,
    vault_token: &str,
) -> Result<Vec<String>, EnvError> {
    prepare_from_map(parent_env(), cfg, client, vault_token).await
}

/// Reads the parent environment into a name→value map. Later duplicates
/// win; non-UTF-8 entries are skipped. The ordered map keeps `pass-all`
/// emission deterministic.
fn parent_env() -> BTreeMap<String, String> {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

async fn prepare_from_map(
    mut env_map: BTreeMap<String, String>,
    cfg: &EnvConfig,
    client: &dyn SecretClient,
    vault_token: &str,
) -> Result<Vec<String>, EnvError> {
    let mut out = EnvList::new();

    if cfg.set_vault_token && !vault_token.is_empty() {
        // The explicit export wins over whatever the parent carried.
        out.put("VAULT_TOKEN", vault_token);
        env_map.remove("VAULT_TOKEN");
        if let Some(addr) = env_map.remove("VAULT_ADDR") {
            out.put("VAULT_ADDR", &addr);
        }
    }

    let replacements =
        expand_replacements(client, &mut env_map, &cfg.vault_replacements).await?;
    process_templates(&mut env_map, &cfg.vault_template_variables, &replacements)?;

    if cfg.pass_all_variables {
        out.put_all(&env_map);
    } else if !cfg.pass_variables.is_empty() {
        out.put_some(&env_map, &cfg.pass_variables);
    }

    Ok(out.into_vec())
}

/// Splits a secret reference into `(type, path, field)`. All three parts
/// must be present and non-empty.
fn parse_secret_id<'a>(name: &str, id: &'a str) -> Result<(&'a str, &'a str, &'a str), EnvError> {
    let mut parts = id.splitn(4, ':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(path), Some(field), None)
            if !kind.is_empty() && !path.is_empty() && !field.is_empty() =>
        {
            Ok((kind, path, field))
        }
        _ => Err(EnvError::SecretRef {
            name: name.to_string(),
        }),
    }
}

/// Expands every configured replacement present in the parent map,
/// overwriting the map entry and collecting the template scope.
///
/// Fetches are cached per `(type, path)` for the duration of the call, so
/// several variables can reference different fields of one lease.
async fn expand_replacements(
    client: &dyn SecretClient,
    env_map: &mut BTreeMap<String, String>,
    keys: &[String],
) -> Result<HashMap<String, String>, EnvError> {
    let mut replacements = HashMap::with_capacity(keys.len());
    let mut db_cache: HashMap<String, DatabaseCredential> = HashMap::new();
    let mut secret_cache: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut aws_cache: HashMap<String, AwsCredential> = HashMap::new();

    for name in keys {
        let Some(value) = env_map.get(name).cloned() else {
            continue;
        };
        let (kind, path, field) = parse_secret_id(name, &value)?;

        let store_err = |source| EnvError::Store {
            name: name.clone(),
            source,
        };

        let resolved = match kind {
            "db" => {
                if !db_cache.contains_key(path) {
                    let (cred, _lease) =
                        client.database_credential(path).await.map_err(store_err)?;
                    db_cache.insert(path.to_string(), cred);
                }
                let cred = &db_cache[path];
                match field {
                    "Username" => cred.username.clone(),
                    "Password" => cred.password.clone(),
                    _ => {
                        return Err(EnvError::UnknownField {
                            name: name.clone(),
                            kind: "db",
                            field: field.to_string(),
                        })
                    }
                }
            }
            "secret" => {
                if !secret_cache.contains_key(path) {
                    let (members, _lease) = client.secret(path).await.map_err(store_err)?;
                    secret_cache.insert(path.to_string(), members);
                }
                secret_cache[path]
                    .get(field)
                    .cloned()
                    .ok_or_else(|| EnvError::MissingField {
                        path: path.to_string(),
                        field: field.to_string(),
                    })?
            }
            "aws-user" => {
                if !aws_cache.contains_key(path) {
                    let (cred, _lease) = client.aws_iam_user(path).await.map_err(store_err)?;
                    aws_cache.insert(path.to_string(), cred);
                }
                let cred = &aws_cache[path];
                match field {
                    "KeyId" => cred.access_key_id.clone(),
                    "SecretKey" => cred.secret_access_key.clone(),
                    _ => {
                        return Err(EnvError::UnknownField {
                            name: name.clone(),
                            kind: "aws-user",
                            field: field.to_string(),
                        })
                    }
                }
            }
            _ => {
                return Err(EnvError::UnknownSecretType {
                    name: name.clone(),
                    kind: kind.to_string(),
                })
            }
        };

        env_map.insert(name.clone(), resolved.clone());
        replacements.insert(name.clone(), resolved);
    }

    Ok(replacements)
}

/// Renders every configured template present in the map, replacing the
/// entry with its rendered output.
fn process_templates(
    env_map: &mut BTreeMap<String, String>,
    vars: &[String],
    replacements: &HashMap<String, String>,
) -> Result<(), EnvError> {
    for name in vars {
        let Some(value) = env_map.get(name) else {
            continue;
        };
        let rendered = template::render(value, replacements).map_err(|err| match err {
            TemplateError::Parse { reason } => EnvError::TemplateParse {
                name: name.clone(),
                reason,
            },
            TemplateError::Unbound { name: unbound } => EnvError::TemplateRender {
                name: name.clone(),
                reason: format!("unbound variable {unbound:?}"),
            },
        })?;
        env_map.insert(name.clone(), rendered);
    }
    Ok(())
}

/// Ordered `KEY=VALUE` accumulator.
#[derive(Debug, Default)]
struct EnvList(Vec<String>);

impl EnvList {
    fn new() -> Self {
        Self::default()
    }

    fn put(&mut self, key: &str, value: &str) {
        self.0.push(format!("{key}={value}"));
    }

    fn put_all(&mut self, map: &BTreeMap<String, String>) {
        for (key, value) in map {
            self.put(key, value);
        }
    }

    fn put_some(&mut self, map: &BTreeMap<String, String>, keys: &[String]) {
        for key in keys {
            if let Some(value) = map.get(key) {
                self.put(key, value);
            }
        }
    }

    fn into_vec(self) -> Vec<String> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    use crate::error::SecretError;
    use crate::secrets::{Lease, RenewalNotice};

    #[derive(Default)]
    struct MockStore {
        db_calls: AtomicUsize,
        secret_calls: AtomicUsize,
        aws_calls: AtomicUsize,
        fail: bool,
    }

    impl MockStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl SecretClient for MockStore {
        async fn authenticate(&self) -> Result<(), SecretError> {
            Ok(())
        }

        async fn run(&self, token: CancellationToken) {
            token.cancelled().await;
        }

        fn notifications(&self) -> broadcast::Receiver<RenewalNotice> {
            broadcast::channel(1).1.resubscribe()
        }

        async fn database_credential(
            &self,
            path: &str,
        ) -> Result<(DatabaseCredential, Lease), SecretError> {
            self.db_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SecretError::Backend {
                    reason: "an error".to_string(),
                });
            }
            let cred = match path {
                "acme" => DatabaseCredential {
                    username: "u".to_string(),
                    password: "p".to_string(),
                },
                _ => DatabaseCredential {
                    username: "user2".to_string(),
                    password: "pass2".to_string(),
                },
            };
            Ok((cred, Lease::default()))
        }

        async fn secret(
            &self,
            path: &str,
        ) -> Result<(HashMap<String, String>, Lease), SecretError> {
            self.secret_calls.fetch_add(1, Ordering::SeqCst);
            let mut members = HashMap::new();
            if path == "kv" {
                members.insert("foo".to_string(), "bar".to_string());
                members.insert("baz".to_string(), "buz".to_string());
            }
            Ok((members, Lease::default()))
        }

        async fn aws_iam_user(&self, _path: &str) -> Result<(AwsCredential, Lease), SecretError> {
            self.aws_calls.fetch_add(1, Ordering::SeqCst);
            Ok((
                AwsCredential {
                    access_key_id: "AKIAEXAMPLE".to_string(),
                    secret_access_key: "wJalrEXAMPLE".to_string(),
                },
                Lease::default(),
            ))
        }
    }

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn env_list_put_variants() {
        let mut list = EnvList::new();
        list.put("foo", "bar");
        assert_eq!(list.0, vec!["foo=bar"]);

        let mut list = EnvList::new();
        list.put_all(&env(&[("biz", "buz"), ("baz", "bif")]));
        assert!(list.0.contains(&"biz=buz".to_string()));
        assert!(list.0.contains(&"baz=bif".to_string()));

        let mut list = EnvList::new();
        list.put_some(
            &env(&[("blah", "hah"), ("fah", "mah"), ("nah", "tah")]),
            &names(&["blah", "fah"]),
        );
        assert_eq!(list.0, vec!["blah=hah", "fah=mah"]);
    }

    #[test]
    fn secret_ids_must_have_three_nonempty_parts() {
        assert!(parse_secret_id("name", "foo:bar").is_err());
        assert!(parse_secret_id("name", "a:b:c:d").is_err());
        assert!(parse_secret_id("name", "::x").is_err());
        assert!(parse_secret_id("name", "").is_err());

        let (kind, path, field) = parse_secret_id("name", "db:path:key").unwrap();
        assert_eq!((kind, path, field), ("db", "path", "key"));

        let err = parse_secret_id("DBU", "oops").unwrap_err();
        assert!(err.to_string().contains("DBU"));
    }

    #[tokio::test]
    async fn replacements_and_templates_with_whitelist() {
        // One db lease feeding two variables and a templated URL; only the
        // whitelisted names are exported.
        let store = MockStore::default();
        let cfg = EnvConfig {
            vault_replacements: names(&["DBU", "DBP"]),
            vault_template_variables: names(&["URL"]),
            pass_variables: names(&["URL", "DBU"]),
            ..EnvConfig::default()
        };
        let map = env(&[
            ("DBU", "db:acme:Username"),
            ("DBP", "db:acme:Password"),
            ("URL", "{{.DBU}}:{{.DBP}}@h/db"),
        ]);

        let out = prepare_from_map(map, &cfg, &store, "").await.unwrap();
        assert_eq!(out, vec!["URL=u:p@h/db", "DBU=u"]);
        assert_eq!(store.db_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replacement_membership_does_not_imply_export() {
        let store = MockStore::default();
        let cfg = EnvConfig {
            vault_replacements: names(&["DBU"]),
            ..EnvConfig::default()
        };
        let map = env(&[("DBU", "db:acme:Username"), ("PLAIN", "1")]);

        let out = prepare_from_map(map, &cfg, &store, "").await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn pass_all_exports_expanded_values() {
        let store = MockStore::default();
        let cfg = EnvConfig {
            pass_all_variables: true,
            vault_replacements: names(&["DBU"]),
            ..EnvConfig::default()
        };
        let map = env(&[("DBU", "db:acme:Username"), ("PLAIN", "1")]);

        let out = prepare_from_map(map, &cfg, &store, "").await.unwrap();
        assert_eq!(out, vec!["DBU=u", "PLAIN=1"]);
    }

    #[tokio::test]
    async fn secret_and_aws_types_resolve_fields() {
        let store = MockStore::default();
        let cfg = EnvConfig {
            pass_all_variables: true,
            vault_replacements: names(&["API_KEY", "OTHER", "AWS_KEY"]),
            ..EnvConfig::default()
        };
        let map = env(&[
            ("API_KEY", "secret:kv:foo"),
            ("OTHER", "secret:kv:baz"),
            ("AWS_KEY", "aws-user:iam:KeyId"),
        ]);

        let out = prepare_from_map(map, &cfg, &store, "").await.unwrap();
        assert!(out.contains(&"API_KEY=bar".to_string()));
        assert!(out.contains(&"OTHER=buz".to_string()));
        assert!(out.contains(&"AWS_KEY=AKIAEXAMPLE".to_string()));
        // Two members of the same secret cost one fetch.
        assert_eq!(store.secret_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.aws_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn replacement_failures_name_the_variable() {
        let store = MockStore::default();
        let cfg = EnvConfig {
            vault_replacements: names(&["BAD"]),
            ..EnvConfig::default()
        };

        let err = prepare_from_map(env(&[("BAD", "nope:x:y")]), &cfg, &store, "")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::UnknownSecretType { .. }));

        let err = prepare_from_map(env(&[("BAD", "db:acme:Frob")]), &cfg, &store, "")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::UnknownField { .. }));

        let err = prepare_from_map(env(&[("BAD", "secret:kv:missing")]), &cfg, &store, "")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::MissingField { .. }));

        let failing = MockStore::failing();
        let err = prepare_from_map(env(&[("BAD", "db:acme:Username")]), &cfg, &failing, "")
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::Store { .. }));
    }

    #[tokio::test]
    async fn vault_token_export_wins_over_parent() {
        let store = MockStore::default();
        let cfg = EnvConfig {
            pass_all_variables: true,
            set_vault_token: true,
            ..EnvConfig::default()
        };
        let map = env(&[
            ("VAULT_TOKEN", "stale"),
            ("VAULT_ADDR", "https://vault:8200"),
            ("HOME", "/root"),
        ]);

        let out = prepare_from_map(map, &cfg, &store, "s.fresh").await.unwrap();
        assert_eq!(
            out,
            vec![
                "VAULT_TOKEN=s.fresh",
                "VAULT_ADDR=https://vault:8200",
                "HOME=/root",
            ]
        );
    }

    #[tokio::test]
    async fn empty_token_is_not_exported() {
        let store = MockStore::default();
        let cfg = EnvConfig {
            set_vault_token: true,
            pass_all_variables: true,
            ..EnvConfig::default()
        };

        let out = prepare_from_map(env(&[("HOME", "/root")]), &cfg, &store, "")
            .await
            .unwrap();
        assert_eq!(out, vec!["HOME=/root"]);
    }

    #[tokio::test]
    async fn preparation_is_idempotent() {
        let store = MockStore::default();
        let cfg = EnvConfig {
            vault_replacements: names(&["DBU", "DBP"]),
            vault_template_variables: names(&["URL"]),
            pass_variables: names(&["URL", "DBU", "DBP"]),
            ..EnvConfig::default()
        };
        let map = env(&[
            ("DBU", "db:acme:Username"),
            ("DBP", "db:acme:Password"),
            ("URL", "{{.DBU}}:{{.DBP}}@h/db"),
        ]);

        let first = prepare_from_map(map.clone(), &cfg, &store, "").await.unwrap();
        let calls_after_first = store.db_calls.load(Ordering::SeqCst);
        let second = prepare_from_map(map, &cfg, &store, "").await.unwrap();
        let calls_after_second = store.db_calls.load(Ordering::SeqCst);

        assert_eq!(first, second);
        assert_eq!(calls_after_second - calls_after_first, calls_after_first);
    }

    #[tokio::test]
    async fn template_errors_carry_the_variable_name() {
        let store = MockStore::default();
        let cfg = EnvConfig {
            vault_replacements: names(&["DBU"]),
            vault_template_variables: names(&["URL"]),
            ..EnvConfig::default()
        };

        let err = prepare_from_map(
            env(&[("DBU", "db:acme:Username"), ("URL", "{{ bad }}")]),
            &cfg,
            &store,
            "",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EnvError::TemplateParse { .. }));
        assert!(err.to_string().contains("URL"));

        let err = prepare_from_map(
            env(&[("DBU", "db:acme:Username"), ("URL", "{{ .NOPE }}")]),
            &cfg,
            &store,
            "",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EnvError::TemplateRender { .. }));
    }
}
