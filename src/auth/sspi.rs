//! Windows SSPI security contexts for the logon session of the current user.

use std::ptr;

use n0_error::{AnyError, Result, anyerr, ensure_any};
use tracing::{debug, warn};
use windows_sys::Win32::{
    Foundation::SEC_I_CONTINUE_NEEDED,
    Security::{
        Authentication::Identity::{
            AcquireCredentialsHandleW, DeleteSecurityContext, FreeContextBuffer,
            FreeCredentialsHandle, ISC_REQ_ALLOCATE_MEMORY, ISC_REQ_CONFIDENTIALITY,
            ISC_REQ_CONNECTION, InitializeSecurityContextW, SECBUFFER_TOKEN, SECBUFFER_VERSION,
            SECPKG_CRED_OUTBOUND, SECURITY_NATIVE_DREP, SecBuffer, SecBufferDesc,
        },
        Credentials::SecHandle,
    },
};

use super::AuthSchemeKind;
use crate::{
    credentials::{
        AuthScope, BasicCredentialsProvider, Credentials, CredentialsProvider, SecurityContext,
    },
    parse::Authority,
};

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// An outbound SSPI context for one negotiation.
pub(crate) struct SspiContext {
    credential: SecHandle,
    context: Option<SecHandle>,
    target_name: Vec<u16>,
}

impl SspiContext {
    pub(crate) fn new(kind: AuthSchemeKind, proxy_host: &str) -> Result<Self> {
        let package = match kind {
            AuthSchemeKind::Spnego => "Negotiate",
            AuthSchemeKind::Kerberos => "Kerberos",
            AuthSchemeKind::Ntlm => "NTLM",
            other => return Err(anyerr!("SSPI does not provide {other}")),
        };
        ensure_any!(!proxy_host.trim().is_empty(), "empty proxy host");

        let target_name = wide(&format!("HTTP/{proxy_host}"));
        let package_name = wide(package);
        let mut credential = SecHandle {
            dwLower: 0,
            dwUpper: 0,
        };
        let mut expiry: i64 = 0;

        let status = unsafe {
            AcquireCredentialsHandleW(
                ptr::null(),
                package_name.as_ptr(),
                SECPKG_CRED_OUTBOUND,
                ptr::null(),
                ptr::null(),
                None,
                ptr::null(),
                &mut credential,
                &mut expiry,
            )
        };
        if status != 0 {
            return Err(anyerr!(
                "AcquireCredentialsHandleW({package}) failed: 0x{:08X}",
                status as u32
            ));
        }
        debug!(package, proxy_host, "acquired SSPI credentials handle");
        Ok(Self {
            credential,
            context: None,
            target_name,
        })
    }
}

impl SecurityContext for SspiContext {
    fn step(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, AnyError> {
        let mut output_buffer = SecBuffer {
            cbBuffer: 0,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: ptr::null_mut(),
        };
        let mut output_desc = SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: &mut output_buffer,
        };
        let mut input_buffer = input.map(|token| SecBuffer {
            cbBuffer: token.len() as u32,
            BufferType: SECBUFFER_TOKEN,
            pvBuffer: token.as_ptr() as *mut _,
        });
        let input_desc = input_buffer.as_mut().map(|buffer| SecBufferDesc {
            ulVersion: SECBUFFER_VERSION,
            cBuffers: 1,
            pBuffers: buffer,
        });

        let mut new_context = SecHandle {
            dwLower: 0,
            dwUpper: 0,
        };
        let mut attrs: u32 = 0;
        let mut expiry: i64 = 0;

        let status = unsafe {
            InitializeSecurityContextW(
                &self.credential,
                self.context
                    .as_ref()
                    .map_or(ptr::null(), |context| context as *const _),
                self.target_name.as_ptr(),
                ISC_REQ_ALLOCATE_MEMORY | ISC_REQ_CONFIDENTIALITY | ISC_REQ_CONNECTION,
                0,
                SECURITY_NATIVE_DREP,
                input_desc
                    .as_ref()
                    .map_or(ptr::null(), |desc| desc as *const _),
                0,
                &mut new_context,
                &mut output_desc,
                &mut attrs,
                &mut expiry,
            )
        };
        self.context = Some(new_context);

        if status != 0 && status != SEC_I_CONTINUE_NEEDED {
            return Err(anyerr!(
                "InitializeSecurityContextW failed: 0x{:08X}",
                status as u32
            ));
        }

        let token = if output_buffer.cbBuffer > 0 && !output_buffer.pvBuffer.is_null() {
            let bytes = unsafe {
                std::slice::from_raw_parts(
                    output_buffer.pvBuffer as *const u8,
                    output_buffer.cbBuffer as usize,
                )
            }
            .to_vec();
            unsafe {
                FreeContextBuffer(output_buffer.pvBuffer);
            }
            bytes
        } else {
            Vec::new()
        };
        Ok(token)
    }
}

impl Drop for SspiContext {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            unsafe {
                DeleteSecurityContext(&context);
            }
        }
        unsafe {
            FreeCredentialsHandle(&self.credential);
        }
    }
}

/// Answers NTLM, Negotiate and Kerberos challenges with the credentials of
/// the logged-on Windows user.
///
/// Basic and Digest still need explicit credentials, taken from `fallback`.
#[derive(Debug, Clone, Default)]
pub struct SspiCredentialsProvider {
    fallback: BasicCredentialsProvider,
}

impl SspiCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(fallback: BasicCredentialsProvider) -> Self {
        Self { fallback }
    }
}

impl CredentialsProvider for SspiCredentialsProvider {
    fn credentials(&self, scope: &AuthScope) -> Option<Credentials> {
        match scope.scheme {
            // prefer the logon session over stored passwords
            Some(AuthSchemeKind::Ntlm) => None,
            _ => self.fallback.credentials(scope),
        }
    }

    fn security_context(
        &self,
        scheme: AuthSchemeKind,
        proxy: &Authority,
    ) -> Option<Box<dyn SecurityContext>> {
        match SspiContext::new(scheme, &proxy.host) {
            Ok(context) => Some(Box::new(context)),
            Err(err) => {
                warn!(%scheme, "cannot use SSPI: {err:#}");
                None
            }
        }
    }
}
