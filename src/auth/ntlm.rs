//! NTLM over HTTP (MS-NLMP), NTLMv2 responses only.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use md4::{Digest, Md4};
use md5::Md5;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};

use super::challenge::AuthChallenge;
use crate::credentials::{Credentials, NtIdentity, SecurityContext};

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;
const NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const NEGOTIATE_EXTENDED_SESSIONSECURITY: u32 = 0x0008_0000;
const NEGOTIATE_128: u32 = 0x2000_0000;
const NEGOTIATE_56: u32 = 0x8000_0000;

const NEGOTIATE_FLAGS: u32 = NEGOTIATE_UNICODE
    | REQUEST_TARGET
    | NEGOTIATE_NTLM
    | NEGOTIATE_ALWAYS_SIGN
    | NEGOTIATE_EXTENDED_SESSIONSECURITY
    | NEGOTIATE_128
    | NEGOTIATE_56;

const AV_EOL: u16 = 0;
const AV_TIMESTAMP: u16 = 7;

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_EPOCH_OFFSET: u64 = 11_644_473_600;

type HmacMd5 = Hmac<Md5>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum NtlmState {
    Uninitiated,
    ChallengeReceived,
    Type1Generated,
    Type2Received(Vec<u8>),
    Type3Generated,
    Failed,
}

enum NtlmEngine {
    Password(Credentials),
    Context(Box<dyn SecurityContext>),
}

impl fmt::Debug for NtlmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NtlmEngine::Password(credentials) => f.debug_tuple("Password").field(credentials).finish(),
            NtlmEngine::Context(_) => f.write_str("Context"),
        }
    }
}

/// NTLM three-leg handshake: Type 1, Type 2 challenge, Type 3.
#[derive(Debug)]
pub(crate) struct NtlmScheme {
    engine: NtlmEngine,
    state: NtlmState,
}

impl NtlmScheme {
    pub(crate) fn new(credentials: Credentials) -> Self {
        Self {
            engine: NtlmEngine::Password(credentials),
            state: NtlmState::Uninitiated,
        }
    }

    /// Tokens come from an external security context, e.g. SSPI.
    pub(crate) fn with_context(context: Box<dyn SecurityContext>) -> Self {
        Self {
            engine: NtlmEngine::Context(context),
            state: NtlmState::Uninitiated,
        }
    }

    pub(crate) fn process_challenge(&mut self, challenge: &AuthChallenge) -> Result<()> {
        match &challenge.token68 {
            None => {
                self.state = if self.state == NtlmState::Uninitiated {
                    NtlmState::ChallengeReceived
                } else {
                    NtlmState::Failed
                };
                Ok(())
            }
            Some(token) if self.state == NtlmState::Type1Generated => {
                match STANDARD.decode(token) {
                    Ok(message) => {
                        self.state = NtlmState::Type2Received(message);
                        Ok(())
                    }
                    Err(err) => {
                        self.state = NtlmState::Failed;
                        Err(err).std_context("invalid base64 in NTLM challenge")
                    }
                }
            }
            Some(_) => {
                self.state = NtlmState::Failed;
                Err(anyerr!("out of sequence NTLM challenge"))
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        matches!(self.state, NtlmState::Type3Generated | NtlmState::Failed)
    }

    pub(crate) fn authenticate(&mut self) -> Result<String> {
        let token = match std::mem::replace(&mut self.state, NtlmState::Failed) {
            NtlmState::ChallengeReceived => {
                let token = match &mut self.engine {
                    NtlmEngine::Password(_) => negotiate_message(),
                    NtlmEngine::Context(context) => context.step(None)?,
                };
                self.state = NtlmState::Type1Generated;
                token
            }
            NtlmState::Type2Received(challenge) => {
                let token = match &mut self.engine {
                    NtlmEngine::Password(credentials) => {
                        let type2 = Type2Message::parse(&challenge)?;
                        let timestamp = type2.timestamp().unwrap_or_else(filetime_now);
                        authenticate_message(
                            credentials.nt_identity(),
                            credentials.password(),
                            &type2,
                            rand::random(),
                            timestamp,
                        )?
                    }
                    NtlmEngine::Context(context) => context.step(Some(&challenge))?,
                };
                self.state = NtlmState::Type3Generated;
                token
            }
            state => {
                self.state = state;
                return Err(anyerr!("no NTLM message to send in state {:?}", self.state));
            }
        };
        ensure_any!(!token.is_empty(), "security context produced an empty NTLM token");
        Ok(format!("NTLM {}", STANDARD.encode(token)))
    }
}

fn filetime_now() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (since_epoch.as_secs() + FILETIME_EPOCH_OFFSET) * 10_000_000
        + u64::from(since_epoch.subsec_nanos() / 100)
}

/// Type 1 message without domain, workstation or version.
pub(crate) fn negotiate_message() -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&NEGOTIATE_FLAGS.to_le_bytes());
    // empty domain and workstation buffers
    for _ in 0..2 {
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&0u16.to_le_bytes());
        msg.extend_from_slice(&32u32.to_le_bytes());
    }
    msg
}

fn read_u16(msg: &[u8], at: usize) -> Result<u16> {
    let bytes = msg.get(at..at + 2).context("truncated NTLM message")?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(msg: &[u8], at: usize) -> Result<u32> {
    let bytes = msg.get(at..at + 4).context("truncated NTLM message")?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn security_buffer(msg: &[u8], at: usize) -> Result<&[u8]> {
    let len = usize::from(read_u16(msg, at)?);
    let offset = read_u32(msg, at + 4)? as usize;
    msg.get(offset..offset + len)
        .context("NTLM security buffer out of bounds")
}

/// The server's Type 2 (challenge) message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Type2Message {
    pub flags: u32,
    pub challenge: [u8; 8],
    pub target_info: Vec<u8>,
}

impl Type2Message {
    pub(crate) fn parse(msg: &[u8]) -> Result<Self> {
        ensure_any!(msg.starts_with(SIGNATURE), "missing NTLMSSP signature");
        ensure_any!(read_u32(msg, 8)? == 2, "not an NTLM challenge message");
        let flags = read_u32(msg, 20)?;
        let mut challenge = [0u8; 8];
        challenge.copy_from_slice(msg.get(24..32).context("truncated NTLM message")?);
        let target_info = if msg.len() >= 48 {
            security_buffer(msg, 40)?.to_vec()
        } else {
            Vec::new()
        };
        Ok(Self {
            flags,
            challenge,
            target_info,
        })
    }

    /// Server timestamp from the `MsvAvTimestamp` AV pair, if present.
    pub(crate) fn timestamp(&self) -> Option<u64> {
        let info = &self.target_info;
        let mut at = 0;
        while at + 4 <= info.len() {
            let id = u16::from_le_bytes([info[at], info[at + 1]]);
            let len = usize::from(u16::from_le_bytes([info[at + 2], info[at + 3]]));
            let value = info.get(at + 4..at + 4 + len)?;
            match id {
                AV_EOL => return None,
                AV_TIMESTAMP => return value.try_into().ok().map(u64::from_le_bytes),
                _ => at += 4 + len,
            }
        }
        None
    }
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn hmac_md5(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac = HmacMd5::new_from_slice(key).map_err(|_| anyerr!("invalid HMAC key"))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// MD4 of the UTF-16LE password.
pub(crate) fn nt_hash(password: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md4::digest(utf16le(password)));
    out
}

pub(crate) fn ntowf_v2(password: &str, user: &str, domain: &str) -> Result<[u8; 16]> {
    let identity = utf16le(&format!("{}{}", user.to_uppercase(), domain));
    hmac_md5(&nt_hash(password), &[&identity[..]])
}

/// Computes the LMv2 and NTLMv2 responses.
pub(crate) fn ntlmv2_responses(
    ntowf: &[u8; 16],
    server_challenge: &[u8; 8],
    client_challenge: &[u8; 8],
    timestamp: u64,
    target_info: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[1, 1, 0, 0, 0, 0, 0, 0]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_challenge);
    blob.extend_from_slice(&[0; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0; 4]);

    let proof = hmac_md5(ntowf, &[&server_challenge[..], &blob[..]])?;
    let mut nt = proof.to_vec();
    nt.extend_from_slice(&blob);

    let mut lm = hmac_md5(ntowf, &[&server_challenge[..], &client_challenge[..]])?.to_vec();
    lm.extend_from_slice(client_challenge);
    Ok((lm, nt))
}

/// Builds the Type 3 (authenticate) message.
pub(crate) fn authenticate_message(
    identity: NtIdentity<'_>,
    password: &str,
    type2: &Type2Message,
    client_challenge: [u8; 8],
    timestamp: u64,
) -> Result<Vec<u8>> {
    let ntowf = ntowf_v2(password, identity.user, identity.domain)?;
    let (lm, nt) = ntlmv2_responses(
        &ntowf,
        &type2.challenge,
        &client_challenge,
        timestamp,
        &type2.target_info,
    )?;
    let flags = (type2.flags & NEGOTIATE_FLAGS) | NEGOTIATE_NTLM;
    let encode = |s: &str| {
        if flags & NEGOTIATE_UNICODE != 0 {
            utf16le(s)
        } else {
            s.as_bytes().to_vec()
        }
    };
    let domain = encode(identity.domain);
    let user = encode(identity.user);
    let workstation = encode(identity.workstation);

    const HEADER_LEN: usize = 64;
    let payload: [&[u8]; 5] = [&domain, &user, &workstation, &lm, &nt];
    let mut offsets = [0usize; 5];
    let mut end = HEADER_LEN;
    for (slot, data) in offsets.iter_mut().zip(payload) {
        *slot = end;
        end += data.len();
    }
    let [domain_at, user_at, workstation_at, lm_at, nt_at] = offsets;

    let mut msg = Vec::with_capacity(end);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    // header order differs from payload order; the session key stays empty
    for (data, at) in [
        (&lm[..], lm_at),
        (&nt[..], nt_at),
        (&domain[..], domain_at),
        (&user[..], user_at),
        (&workstation[..], workstation_at),
        (&[][..], end),
    ] {
        let len = u16::try_from(data.len()).std_context("NTLM field too long")?;
        let at = u32::try_from(at).std_context("NTLM message too long")?;
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&len.to_le_bytes());
        msg.extend_from_slice(&at.to_le_bytes());
    }
    msg.extend_from_slice(&flags.to_le_bytes());
    for data in payload {
        msg.extend_from_slice(data);
    }
    Ok(msg)
}
