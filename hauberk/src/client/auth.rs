//! The ssh-userauth state machine: service request, a `none` probe to
//! discover the allowed methods, then the configured credentials in order.

use std::sync::Arc;

use log::{debug, info};
use ssh_encoding::{Decode, Encode};
use ssh_key::{PrivateKey, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::{pubkey_algorithm_name, sign_detached, Credential, MethodSet, Signer};
use crate::transport::Transport;
use crate::wire::{malformed, NameList};
use crate::{msg, Error, SecureVec};

const SERVICE_USERAUTH: &str = "ssh-userauth";
const SERVICE_CONNECTION: &str = "ssh-connection";

enum AuthReply {
    Success,
    Failure { methods: MethodSet },
    PkOk,
}

pub(crate) async fn authenticate<S>(
    transport: &mut Transport<S>,
    user: &str,
    credentials: &[Credential],
    session_id: &SecureVec,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request_userauth_service(transport).await?;

    // A `none` probe discovers which methods the server will accept.
    let mut allowed = match probe_none(transport, user).await? {
        AuthReply::Success => return Ok(()),
        AuthReply::Failure { methods } => methods,
        AuthReply::PkOk => return Err(Error::Protocol),
    };
    debug!("server accepts: {allowed:?}");

    for credential in credentials {
        if !allowed.intersects(credential.method()) {
            debug!("skipping {credential:?}: method not offered by server");
            continue;
        }
        let reply = match credential {
            Credential::Password(password) => {
                try_password(transport, user, password).await?
            }
            Credential::Key(key) => try_key(transport, user, key, session_id).await?,
            Credential::KeyFile(path) => {
                let key = match PrivateKey::read_openssh_file(path) {
                    Ok(key) => Arc::new(key),
                    Err(e) => {
                        info!("could not load key file {path:?}: {e}");
                        continue;
                    }
                };
                try_key(transport, user, &key, session_id).await?
            }
            Credential::External(signer) => {
                try_external(transport, user, signer.as_ref(), session_id).await?
            }
        };
        match reply {
            AuthReply::Success => return Ok(()),
            AuthReply::Failure { methods } => {
                allowed = methods;
            }
            AuthReply::PkOk => return Err(Error::Protocol),
        }
    }

    Err(Error::AuthenticationFailed { methods: allowed })
}

async fn request_userauth_service<S>(transport: &mut Transport<S>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut payload = SecureVec::new();
    payload.push(msg::SERVICE_REQUEST);
    SERVICE_USERAUTH.encode(&mut payload)?;
    transport.send_payload(&payload).await?;

    let reply = transport.read_significant().await?;
    if reply.msg_id() != Some(msg::SERVICE_ACCEPT) {
        return Err(Error::Protocol);
    }
    let r = &mut reply.payload().get(1..).ok_or(Error::MalformedPacket)?;
    let service = String::decode(r).map_err(malformed)?;
    if service != SERVICE_USERAUTH {
        return Err(Error::Protocol);
    }
    Ok(())
}

fn request_header(user: &str, method: &str) -> Result<SecureVec, Error> {
    let mut payload = SecureVec::new();
    payload.push(msg::USERAUTH_REQUEST);
    user.encode(&mut payload)?;
    SERVICE_CONNECTION.encode(&mut payload)?;
    method.encode(&mut payload)?;
    Ok(payload)
}

async fn probe_none<S>(transport: &mut Transport<S>, user: &str) -> Result<AuthReply, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = request_header(user, "none")?;
    transport.send_payload(&payload).await?;
    read_auth_reply(transport, false).await
}

async fn try_password<S>(
    transport: &mut Transport<S>,
    user: &str,
    password: &str,
) -> Result<AuthReply, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut payload = request_header(user, "password")?;
    payload.push(0); // FALSE: not a password change
    password.encode(&mut payload)?;
    transport.send_payload(&payload).await?;
    read_auth_reply(transport, false).await
}

/// The probe-then-sign publickey flow
/// (https://tools.ietf.org/html/rfc4252#section-7): first ask whether the
/// key is acceptable, only then compute the signature over the session id
/// and the request body.
async fn try_key<S>(
    transport: &mut Transport<S>,
    user: &str,
    key: &Arc<PrivateKey>,
    session_id: &SecureVec,
) -> Result<AuthReply, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let public = key.public_key();
    match probe_pubkey(transport, user, public).await? {
        AuthReply::PkOk => {}
        reply => return Ok(reply),
    }

    let request = signed_request_body(user, public)?;
    let mut to_sign = SecureVec::new();
    session_id.as_ref().encode(&mut to_sign)?;
    to_sign.extend(&request);

    let signature = sign_detached(key, &to_sign)?;
    let mut sig_blob = Vec::new();
    signature.encode(&mut sig_blob)?;

    send_signed_request(transport, request, &sig_blob).await
}

async fn try_external<S>(
    transport: &mut Transport<S>,
    user: &str,
    signer: &dyn Signer,
    session_id: &SecureVec,
) -> Result<AuthReply, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let public = signer.public_key().clone();
    match probe_pubkey(transport, user, &public).await? {
        AuthReply::PkOk => {}
        reply => return Ok(reply),
    }

    let request = signed_request_body(user, &public)?;
    let mut to_sign = SecureVec::new();
    session_id.as_ref().encode(&mut to_sign)?;
    to_sign.extend(&request);

    let sig_blob = match signer.sign(&to_sign).await {
        Ok(blob) => blob,
        Err(e) => {
            info!("external signer failed: {e}");
            return Ok(AuthReply::Failure {
                methods: MethodSet::PUBLICKEY,
            });
        }
    };

    send_signed_request(transport, request, &sig_blob).await
}

async fn probe_pubkey<S>(
    transport: &mut Transport<S>,
    user: &str,
    public: &PublicKey,
) -> Result<AuthReply, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut payload = request_header(user, "publickey")?;
    payload.push(0); // FALSE: probe only, no signature
    pubkey_algorithm_name(public).encode(&mut payload)?;
    public.to_bytes()?.encode(&mut payload)?;
    transport.send_payload(&payload).await?;
    read_auth_reply(transport, true).await
}

fn signed_request_body(user: &str, public: &PublicKey) -> Result<SecureVec, Error> {
    let mut request = request_header(user, "publickey")?;
    request.push(1); // TRUE: signature follows
    pubkey_algorithm_name(public).encode(&mut request)?;
    public.to_bytes()?.encode(&mut request)?;
    Ok(request)
}

async fn send_signed_request<S>(
    transport: &mut Transport<S>,
    mut request: SecureVec,
    sig_blob: &[u8],
) -> Result<AuthReply, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    sig_blob.encode(&mut request)?;
    transport.send_payload(&request).await?;
    read_auth_reply(transport, false).await
}

/// Wait for the server's verdict on the current request. `expect_pk_ok`
/// disambiguates message 60, which is PK_OK during publickey and
/// PASSWD_CHANGEREQ during password.
async fn read_auth_reply<S>(
    transport: &mut Transport<S>,
    expect_pk_ok: bool,
) -> Result<AuthReply, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let reply = transport.read_significant().await?;
        match reply.msg_id() {
            Some(msg::USERAUTH_SUCCESS) => return Ok(AuthReply::Success),
            Some(msg::USERAUTH_FAILURE) => {
                let r = &mut reply.payload().get(1..).ok_or(Error::MalformedPacket)?;
                let methods = NameList::decode(r).map_err(malformed)?;
                let partial = u8::decode(r).map_err(malformed)? != 0;
                debug!("authentication failure, partial = {partial}");
                return Ok(AuthReply::Failure {
                    methods: MethodSet::from_name_list(&methods),
                });
            }
            Some(msg::USERAUTH_PK_OK) if expect_pk_ok => return Ok(AuthReply::PkOk),
            Some(msg::USERAUTH_PASSWD_CHANGEREQ) => {
                // No change-password hook: the attempt failed.
                info!("server requests a password change; not supported");
                return Ok(AuthReply::Failure {
                    methods: MethodSet::PASSWORD,
                });
            }
            Some(msg::USERAUTH_BANNER) => {
                let r = &mut reply.payload().get(1..).ok_or(Error::MalformedPacket)?;
                let banner = String::decode(r).map_err(malformed)?;
                info!("server banner: {}", banner.trim_end());
            }
            _ => return Err(Error::Protocol),
        }
    }
}
