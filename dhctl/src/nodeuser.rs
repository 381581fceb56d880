use std::time::Duration;

use data_encoding::HEXLOWER;
use dhctl_core::{
    kubernetes::errors::{is_already_exists, is_not_found},
    resources::crd::{NodeUser, NodeUserSpec},
    MASTER_NODE_GROUP_NAME,
};
use log::{debug, info};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha_crypt::{sha512_simple, Sha512Params};
use ssh_key::{
    private::{KeypairData, RsaKeypair},
    LineEnding, PrivateKey,
};
use thiserror::Error;

use crate::{
    context::ConvergeContext, error::ConvergeError, retry::RetryLoop, state::with_deadline,
};

pub const NODE_USER_UID: i64 = 64535;
pub const NODE_USER_NAME_PREFIX: &str = "dhctl-converge-";

const PASSWORD_BYTES: usize = 16;
const NAME_SUFFIX_BYTES: usize = 4;
const RSA_KEY_BITS: usize = 2048;
const KEY_COMMENT: &str = "dhctl-converge";

const NODE_USER_ATTEMPTS: u32 = 10;
const NODE_USER_RETRY_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum NodeUserError {
    #[error("Couldn't generate the node user key: {}", .0)]
    Key(ssh_key::Error),
    #[error("Couldn't hash the node user password: {}", .0)]
    PasswordHash(String),
    #[error("Node user generation task failed: {}", .0)]
    Task(String),
}

/// What the Core keeps to log in as the generated user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUserCredentials {
    pub name: String,
    /// OpenSSH private key, encrypted with `password`
    pub private_key: String,
    pub password: String,
}

impl NodeUserCredentials {
    /// The private key without its passphrase, for the ssh client.
    pub fn decrypted_private_key(&self) -> Result<String, NodeUserError> {
        let key = PrivateKey::from_openssh(&self.private_key).map_err(NodeUserError::Key)?;
        let key = if key.is_encrypted() {
            key.decrypt(self.password.as_bytes())
                .map_err(NodeUserError::Key)?
        } else {
            key
        };

        Ok(key
            .to_openssh(LineEnding::LF)
            .map_err(NodeUserError::Key)?
            .to_string())
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedNodeUser {
    pub node_user: NodeUser,
    pub credentials: NodeUserCredentials,
}

pub trait NodeUserIssuer: Send + Sync {
    fn issue(&self) -> Result<GeneratedNodeUser, NodeUserError>;
}

pub struct RsaNodeUserIssuer;

impl NodeUserIssuer for RsaNodeUserIssuer {
    fn issue(&self) -> Result<GeneratedNodeUser, NodeUserError> {
        generate_node_user()
    }
}

pub fn generate_node_user() -> Result<GeneratedNodeUser, NodeUserError> {
    let mut rng = OsRng;

    let mut password = [0u8; PASSWORD_BYTES];
    rng.fill_bytes(&mut password);
    let password = HEXLOWER.encode(&password);

    let mut suffix = [0u8; NAME_SUFFIX_BYTES];
    rng.fill_bytes(&mut suffix);
    let name = format!("{NODE_USER_NAME_PREFIX}{}", HEXLOWER.encode(&suffix));

    let password_hash = sha512_simple(&password, &Sha512Params::default())
        .map_err(|error| NodeUserError::PasswordHash(format!("{error:?}")))?;

    let keypair = RsaKeypair::random(&mut rng, RSA_KEY_BITS).map_err(NodeUserError::Key)?;
    let private_key =
        PrivateKey::new(KeypairData::Rsa(keypair), KEY_COMMENT).map_err(NodeUserError::Key)?;
    let ssh_public_key = private_key
        .public_key()
        .to_openssh()
        .map_err(NodeUserError::Key)?;
    let encrypted_key = private_key
        .encrypt(&mut rng, password.as_bytes())
        .map_err(NodeUserError::Key)?
        .to_openssh(LineEnding::LF)
        .map_err(NodeUserError::Key)?
        .to_string();

    debug!("Generated node user '{name}'");

    Ok(GeneratedNodeUser {
        node_user: NodeUser::for_converge(
            &name,
            NodeUserSpec {
                uid: NODE_USER_UID,
                ssh_public_key: Some(ssh_public_key),
                password_hash,
                is_sudoer: true,
                node_groups: vec![MASTER_NODE_GROUP_NAME.to_owned()],
            },
        ),
        credentials: NodeUserCredentials {
            name,
            private_key: encrypted_key,
            password,
        },
    })
}

pub async fn create_or_update_node_user(
    ctx: &ConvergeContext,
    node_user: &NodeUser,
) -> Result<(), ConvergeError> {
    let name = node_user.metadata.name.clone().unwrap_or_default();
    let action = format!("create NodeUser '{name}'");

    RetryLoop::new(&action, NODE_USER_ATTEMPTS, NODE_USER_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async {
            let client = ctx.kube_client();
            match with_deadline(&action, client.create_node_user(node_user)).await? {
                Ok(_) => Ok(()),
                Err(error) if is_already_exists(&error) => {
                    with_deadline(&action, client.replace_node_user(node_user))
                        .await?
                        .map(|_| ())
                        .map_err(|error| ConvergeError::kube(&action, error))
                }
                Err(error) => Err(ConvergeError::kube(&action, error)),
            }
        })
        .await?;

    info!("NodeUser '{name}' is in place");

    Ok(())
}

pub async fn delete_node_user(ctx: &ConvergeContext, name: &str) -> Result<(), ConvergeError> {
    let action = format!("delete NodeUser '{name}'");

    RetryLoop::new(&action, NODE_USER_ATTEMPTS, NODE_USER_RETRY_WAIT)
        .break_if(ConvergeError::is_interrupted)
        .with_cancellation(ctx.cancellation())
        .run(|| async {
            match with_deadline(&action, ctx.kube_client().delete_node_user(name)).await? {
                Err(error) if is_not_found(&error) => Ok(()),
                result => result.map_err(|error| ConvergeError::kube(&action, error)),
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use sha_crypt::sha512_check;

    use crate::testing::{test_node_user, TestEnvironment};

    use super::*;

    #[test]
    fn generated_credentials_are_consistent() {
        let first = generate_node_user().unwrap();
        let second = generate_node_user().unwrap();
        let spec = &first.node_user.spec;
        let credentials = &first.credentials;

        assert!(credentials.name.starts_with(NODE_USER_NAME_PREFIX));
        assert_eq!(credentials.name.len(), NODE_USER_NAME_PREFIX.len() + 8);
        assert_eq!(first.node_user.metadata.name.as_ref(), Some(&credentials.name));
        assert_eq!(credentials.password.len(), 32);
        assert!(credentials
            .password
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert!(spec.password_hash.starts_with("$6$"));
        assert!(sha512_check(&credentials.password, &spec.password_hash).is_ok());
        assert_eq!(spec.uid, NODE_USER_UID);
        assert!(spec.is_sudoer);
        assert_eq!(spec.node_groups, vec!["master".to_owned()]);
        assert!(spec
            .ssh_public_key
            .as_deref()
            .unwrap()
            .starts_with("ssh-rsa "));

        let encrypted = PrivateKey::from_openssh(&credentials.private_key).unwrap();
        assert!(encrypted.is_encrypted());

        let decrypted = PrivateKey::from_openssh(credentials.decrypted_private_key().unwrap())
            .unwrap();
        assert_eq!(
            decrypted.public_key().to_openssh().unwrap(),
            spec.ssh_public_key.clone().unwrap()
        );

        assert_ne!(first.credentials.name, second.credentials.name);
        assert_ne!(first.credentials.password, second.credentials.password);
    }

    #[tokio::test(start_paused = true)]
    async fn create_falls_back_to_update() {
        let env = TestEnvironment::new();
        let ctx = env.context();
        let generated = test_node_user();

        create_or_update_node_user(&ctx, &generated.node_user)
            .await
            .unwrap();
        create_or_update_node_user(&ctx, &generated.node_user)
            .await
            .unwrap();

        assert_eq!(env.cluster.call_count("replace_node_user"), 1);
        assert!(env.cluster.node_user(&generated.credentials.name).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn delete_tolerates_absent_user() {
        let env = TestEnvironment::new();
        let ctx = env.context();
        let generated = test_node_user();

        create_or_update_node_user(&ctx, &generated.node_user)
            .await
            .unwrap();
        delete_node_user(&ctx, &generated.credentials.name)
            .await
            .unwrap();
        delete_node_user(&ctx, &generated.credentials.name)
            .await
            .unwrap();

        assert!(env.cluster.node_user(&generated.credentials.name).is_none());
    }
}
