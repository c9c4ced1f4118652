// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use rustls::ClientConfig;
use rustls::crypto::CryptoProvider;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid root certificate: {0}")]
    InvalidRootCert(String),
    #[error("invalid client identity: {0}")]
    InvalidIdentity(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Where to find the certificates that verify the API server.
#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum RootCert {
    File(PathBuf),
    Static(Bytes),
    Default,
}

/// A PEM encoded client certificate chain and its private key.
#[derive(Clone)]
pub struct ClientIdentity {
    pub cert_chain: Bytes,
    pub key: Bytes,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity").finish_non_exhaustive()
    }
}

// All crypto MUST be done via the below providers.
#[cfg(feature = "tls-aws-lc")]
pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

#[cfg(all(feature = "tls-ring", not(feature = "tls-aws-lc")))]
pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

pub async fn root_to_store(root_cert: &RootCert) -> Result<rustls::RootCertStore, Error> {
    let mut roots = rustls::RootCertStore::empty();
    match root_cert {
        RootCert::File(f) => {
            let certfile = tokio::fs::read(f)
                .await
                .map_err(|e| Error::InvalidRootCert(format!("{}: {e}", f.display())))?;
            add_pem_certs(&mut roots, &certfile)?;
        }
        RootCert::Static(b) => add_pem_certs(&mut roots, b)?,
        RootCert::Default => {
            let loaded = rustls_native_certs::load_native_certs();
            if loaded.certs.is_empty() {
                if let Some(e) = loaded.errors.first() {
                    return Err(Error::InvalidRootCert(e.to_string()));
                }
            }
            roots.add_parsable_certificates(loaded.certs);
        }
    };
    Ok(roots)
}

fn add_pem_certs(roots: &mut rustls::RootCertStore, pem: &[u8]) -> Result<(), Error> {
    let mut reader = std::io::BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidRootCert(e.to_string()))?;
    if certs.is_empty() {
        return Err(Error::InvalidRootCert("no certificates found".to_string()));
    }
    let (_, ignored) = roots.add_parsable_certificates(certs);
    if roots.is_empty() {
        return Err(Error::InvalidRootCert(format!(
            "{ignored} certificates could not be parsed"
        )));
    }
    Ok(())
}

/// client_config builds the TLS configuration used to reach an API server.
pub async fn client_config(
    root_cert: &RootCert,
    identity: Option<&ClientIdentity>,
) -> Result<ClientConfig, Error> {
    let roots = root_to_store(root_cert).await?;
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots);
    let Some(identity) = identity else {
        return Ok(builder.with_no_client_auth());
    };
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(Cursor::new(
        &identity.cert_chain,
    )))
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| Error::InvalidIdentity(e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(Cursor::new(
        &identity.key,
    )))
    .map_err(|e| Error::InvalidIdentity(e.to_string()))?
    .ok_or_else(|| Error::InvalidIdentity("no private key found".to_string()))?;
    Ok(builder.with_client_auth_cert(certs, key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;

    #[tokio::test]
    async fn static_root_must_hold_certificates() {
        let res = root_to_store(&RootCert::Static(Bytes::from_static(b"not a pem"))).await;
        assert_matches!(res, Err(Error::InvalidRootCert(_)));
    }

    #[tokio::test]
    async fn missing_root_file() {
        let res = root_to_store(&RootCert::File("/nonexistent/ca.crt".into())).await;
        assert_matches!(res, Err(Error::InvalidRootCert(_)));
    }

    #[tokio::test]
    async fn identity_without_key() {
        let identity = ClientIdentity {
            cert_chain: Bytes::new(),
            key: Bytes::new(),
        };
        let res = client_config(&RootCert::Static(Bytes::new()), Some(&identity)).await;
        assert!(res.is_err());
    }
}
