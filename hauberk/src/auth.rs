// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
//! Credentials and the authentication method set.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use ssh_key::{Algorithm, PrivateKey, PublicKey};

use crate::wire::NameList;
use crate::Error;

bitflags! {
    /// Set of authentication methods, represented by bit flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodSet: u32 {
        /// The SSH `none` method (no authentication).
        const NONE = 1;
        /// The SSH `password` method (plaintext passwords).
        const PASSWORD = 2;
        /// The SSH `publickey` method (sign a challenge sent by the
        /// server).
        const PUBLICKEY = 4;
        /// The SSH `hostbased` method (certain hostnames are allowed by
        /// the server).
        const HOSTBASED = 8;
        /// The SSH `keyboard-interactive` method.
        const KEYBOARD_INTERACTIVE = 16;
    }
}

impl MethodSet {
    pub(crate) fn from_method_name(name: &str) -> Option<MethodSet> {
        match name {
            "none" => Some(MethodSet::NONE),
            "password" => Some(MethodSet::PASSWORD),
            "publickey" => Some(MethodSet::PUBLICKEY),
            "hostbased" => Some(MethodSet::HOSTBASED),
            "keyboard-interactive" => Some(MethodSet::KEYBOARD_INTERACTIVE),
            _ => None,
        }
    }

    pub(crate) fn from_name_list(list: &NameList) -> MethodSet {
        list.0
            .iter()
            .filter_map(|name| Self::from_method_name(name))
            .fold(MethodSet::empty(), |acc, m| acc | m)
    }
}

/// An external signing hook, for keys held elsewhere (an agent, an HSM).
/// The signature must be the SSH wire form: `string algorithm` followed by `string
/// blob`.
#[async_trait]
pub trait Signer: Send + Sync {
    fn public_key(&self) -> &PublicKey;

    async fn sign(
        &self,
        data: &[u8],
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync>>;
}

/// One way to authenticate, tried in the order configured.
#[derive(Clone)]
pub enum Credential {
    /// The SSH `password` method.
    Password(String),
    /// The SSH `publickey` method with an in-memory private key.
    Key(Arc<PrivateKey>),
    /// The SSH `publickey` method with an OpenSSH-format key file, loaded
    /// lazily at authentication time.
    KeyFile(PathBuf),
    /// The SSH `publickey` method through an external [`Signer`].
    External(Arc<dyn Signer>),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => write!(f, "Password([hidden])"),
            Credential::Key(k) => write!(f, "Key({})", k.algorithm()),
            Credential::KeyFile(p) => write!(f, "KeyFile({p:?})"),
            Credential::External(s) => write!(f, "External({})", s.public_key().algorithm()),
        }
    }
}

impl Credential {
    pub(crate) fn method(&self) -> MethodSet {
        match self {
            Credential::Password(_) => MethodSet::PASSWORD,
            _ => MethodSet::PUBLICKEY,
        }
    }
}

/// The algorithm name sent in a publickey request. RSA keys authenticate
/// as `rsa-sha2-512` (RFC 8332); everything else uses its own name.
pub(crate) fn pubkey_algorithm_name(key: &PublicKey) -> String {
    match key.algorithm() {
        Algorithm::Rsa { .. } => "rsa-sha2-512".to_string(),
        a => a.to_string(),
    }
}

pub(crate) fn sign_detached(key: &PrivateKey, data: &[u8]) -> Result<ssh_key::Signature, Error> {
    Ok(signature::Signer::try_sign(key.key_data(), data)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn method_set_parses_server_lists() {
        let list = NameList::from_encoded_string("publickey,password,hostbased,gssapi-with-mic");
        let set = MethodSet::from_name_list(&list);
        assert!(set.contains(MethodSet::PUBLICKEY | MethodSet::PASSWORD | MethodSet::HOSTBASED));
        assert!(!set.contains(MethodSet::KEYBOARD_INTERACTIVE));
    }
}
