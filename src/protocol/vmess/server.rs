//! Server half of the session codec

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::common::Address;
use crate::crypto::{fnv1a32, md5_sum, new_decryptor, new_encryptor, CryptionReader, CryptionWriter};
use crate::error::{Error, Result};

use super::id::ID_BYTES_LEN;
use super::{
    timestamp_iv, RequestCommand, RequestHeader, RequestOption, ResponseHeader, UserValidator,
    ADDR_TYPE_DOMAIN, ADDR_TYPE_IPV4, ADDR_TYPE_IPV6, FIXED_HEADER_LEN, VERSION,
};

/// Progress of a server session. Any decode failure moves to `Failed`,
/// which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitIdentity,
    AwaitHeaderDecrypt,
    AwaitAddressPayload,
    AwaitIntegrityCheck,
    HeaderReady,
    BodyStreaming,
    Failed,
}

#[derive(Clone)]
struct BodyKeys {
    key: [u8; 16],
    iv: [u8; 16],
    echo: u8,
}

/// Per-connection server state.
pub struct ServerSession {
    validator: Arc<dyn UserValidator>,
    state: SessionState,
    keys: Option<BodyKeys>,
}

impl ServerSession {
    pub fn new(validator: Arc<dyn UserValidator>) -> Self {
        Self {
            validator,
            state: SessionState::AwaitIdentity,
            keys: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Body key chosen by the client, once the header is decoded
    pub fn request_body_key(&self) -> Option<&[u8; 16]> {
        self.keys.as_ref().map(|k| &k.key)
    }

    /// Body IV chosen by the client, once the header is decoded
    pub fn request_body_iv(&self) -> Option<&[u8; 16]> {
        self.keys.as_ref().map(|k| &k.iv)
    }

    /// Authenticate the client and decode its request header.
    ///
    /// Reads exactly the token, the header and its checksum; body bytes stay
    /// in `reader`. On an unknown token only the 16 token bytes are consumed.
    pub async fn decode_request_header<R>(&mut self, reader: &mut R) -> Result<RequestHeader>
    where
        R: AsyncRead + Unpin,
    {
        if self.state != SessionState::AwaitIdentity {
            return Err(Error::Protocol(format!(
                "request header decode in state {:?}",
                self.state
            )));
        }
        match self.read_request_header(reader).await {
            Ok(header) => {
                self.state = SessionState::HeaderReady;
                Ok(header)
            }
            Err(e) => {
                debug!("VMess in: header rejected in {:?}: {}", self.state, e);
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn read_request_header<R>(&mut self, reader: &mut R) -> Result<RequestHeader>
    where
        R: AsyncRead + Unpin,
    {
        let mut token = [0u8; ID_BYTES_LEN];
        reader.read_exact(&mut token).await?;
        let (user, timestamp) = self.validator.get(&token).ok_or(Error::InvalidUser)?;
        self.state = SessionState::AwaitHeaderDecrypt;

        let cipher = new_decryptor(user.id.cmd_key(), &timestamp_iv(timestamp))?;
        let mut decryptor = CryptionReader::new(reader, cipher);

        let mut header = vec![0u8; FIXED_HEADER_LEN];
        decryptor.read_exact(&mut header).await?;

        let version = header[0];
        if version != VERSION {
            return Err(Error::InvalidVersion(version));
        }

        let mut keys = BodyKeys {
            key: [0u8; 16],
            iv: [0u8; 16],
            echo: header[33],
        };
        keys.iv.copy_from_slice(&header[1..17]);
        keys.key.copy_from_slice(&header[17..33]);
        let option = RequestOption(header[34]);
        let command_byte = header[37];
        let port = u16::from_be_bytes([header[38], header[39]]);
        let addr_type = header[40];
        self.state = SessionState::AwaitAddressPayload;

        let address = match addr_type {
            ADDR_TYPE_IPV4 => {
                let octets = read_extend(&mut decryptor, &mut header, 4).await?;
                Address::from_ip_bytes(octets).ok_or(Error::CorruptedPacket)?
            }
            ADDR_TYPE_IPV6 => {
                let octets = read_extend(&mut decryptor, &mut header, 16).await?;
                Address::from_ip_bytes(octets).ok_or(Error::CorruptedPacket)?
            }
            ADDR_TYPE_DOMAIN => {
                let len = read_extend(&mut decryptor, &mut header, 1).await?[0] as usize;
                if len == 0 {
                    return Err(Error::CorruptedPacket);
                }
                let domain = read_extend(&mut decryptor, &mut header, len).await?;
                let domain = std::str::from_utf8(domain).map_err(|_| Error::CorruptedPacket)?;
                Address::domain(domain)
            }
            _ => return Err(Error::CorruptedPacket),
        };
        self.state = SessionState::AwaitIntegrityCheck;

        let mut checksum = [0u8; 4];
        decryptor.read_exact(&mut checksum).await?;
        if u32::from_be_bytes(checksum) != fnv1a32(&header) {
            return Err(Error::CorruptedPacket);
        }

        let command = RequestCommand::from_byte(command_byte).ok_or(Error::CorruptedPacket)?;
        self.keys = Some(keys);

        debug!(
            "VMess in: user={} command={:?} option={:?} target={}:{}",
            user.email, command, option, address, port
        );

        Ok(RequestHeader {
            version,
            user,
            command,
            option,
            address,
            port,
        })
    }

    /// Wrap `reader` to decrypt the request body.
    pub fn decode_request_body<R>(&mut self, reader: R) -> Result<CryptionReader<R>> {
        let keys = self.ready_keys()?;
        let reader = CryptionReader::new(reader, new_decryptor(&keys.key, &keys.iv)?);
        self.state = SessionState::BodyStreaming;
        Ok(reader)
    }

    /// Write the response header into `writer` and return the writer that
    /// encrypts the response body.
    ///
    /// The header bytes may still be buffered inside the returned writer;
    /// they go out with the first body write, flush or shutdown.
    pub async fn encode_response_header<W>(
        &mut self,
        header: &ResponseHeader,
        writer: W,
    ) -> Result<CryptionWriter<W>>
    where
        W: AsyncWrite + Unpin,
    {
        let keys = self.ready_keys()?;
        let response_key = md5_sum(&[&keys.key[..]]);
        let response_iv = md5_sum(&[&keys.iv[..]]);
        let mut writer = CryptionWriter::new(writer, new_encryptor(&response_key, &response_iv)?);

        let mut head = vec![keys.echo, 0x00];
        match &header.command {
            Some(command) => {
                if let Err(e) = command.marshal(&mut head) {
                    warn!("VMess in: dropping response command: {}", e);
                    head.extend_from_slice(&[0x00, 0x00]);
                }
            }
            None => head.extend_from_slice(&[0x00, 0x00]),
        }
        writer.write_all(&head).await?;
        self.state = SessionState::BodyStreaming;
        Ok(writer)
    }

    fn ready_keys(&self) -> Result<BodyKeys> {
        self.keys
            .clone()
            .ok_or_else(|| Error::Protocol(format!("no request header decoded ({:?})", self.state)))
    }
}

/// Read `n` more header bytes, returning them.
async fn read_extend<'a, R>(reader: &mut R, header: &'a mut Vec<u8>, n: usize) -> Result<&'a [u8]>
where
    R: AsyncRead + Unpin,
{
    let start = header.len();
    header.resize(start + n, 0);
    reader.read_exact(&mut header[start..]).await?;
    Ok(&header[start..])
}
