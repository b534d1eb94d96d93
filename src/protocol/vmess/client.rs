//! Client half of the session codec

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::common::Address;
use crate::crypto::{
    fnv1a32, md5_sum, new_decryptor, new_encryptor, random_bytes, CryptionReader, CryptionWriter,
};
use crate::error::{Error, Result};

use super::{
    timestamp_iv, RequestHeader, ResponseCommand, ResponseHeader, ADDR_TYPE_DOMAIN,
    ADDR_TYPE_IPV4, ADDR_TYPE_IPV6,
};

/// Maximum skew applied to the client timestamp, in seconds
const TIMESTAMP_JITTER: i64 = 30;

/// A timestamp within ±30 s of `now`, hiding the client's exact clock
pub fn random_timestamp(now: u64) -> u64 {
    let delta = rand::thread_rng().gen_range(-TIMESTAMP_JITTER..=TIMESTAMP_JITTER);
    now.saturating_add_signed(delta)
}

/// Per-connection client state: the body keys it picked and the byte the
/// server must echo back.
#[derive(Clone)]
pub struct ClientSession {
    request_body_key: [u8; 16],
    request_body_iv: [u8; 16],
    response_body_key: [u8; 16],
    response_body_iv: [u8; 16],
    response_header: u8,
}

impl ClientSession {
    /// Session with random body key, IV and echo byte
    pub fn new() -> Self {
        let [echo] = random_bytes::<1>();
        Self::with_keys(random_bytes(), random_bytes(), echo)
    }

    pub fn with_keys(body_key: [u8; 16], body_iv: [u8; 16], response_header: u8) -> Self {
        Self {
            request_body_key: body_key,
            request_body_iv: body_iv,
            response_body_key: md5_sum(&[&body_key[..]]),
            response_body_iv: md5_sum(&[&body_iv[..]]),
            response_header,
        }
    }

    pub fn request_body_key(&self) -> &[u8; 16] {
        &self.request_body_key
    }

    pub fn request_body_iv(&self) -> &[u8; 16] {
        &self.request_body_iv
    }

    /// Token plus encrypted header, ready to be sent ahead of the body.
    ///
    /// The token is computed from a random ID of the user; the header is
    /// encrypted with the primary ID's command key.
    pub fn encode_request_header(&self, header: &RequestHeader, timestamp: u64) -> Result<Vec<u8>> {
        let id = header.user.any_valid_id();

        let mut plain = Vec::with_capacity(41 + 1 + 255 + 4);
        plain.push(header.version);
        plain.extend_from_slice(&self.request_body_iv);
        plain.extend_from_slice(&self.request_body_key);
        plain.push(self.response_header);
        plain.push(header.option.0);
        plain.extend_from_slice(&[0x00, 0x00]);
        plain.push(header.command.to_byte());
        plain.extend_from_slice(&header.port.to_be_bytes());
        match &header.address {
            Address::Ip(std::net::IpAddr::V4(ip)) => {
                plain.push(ADDR_TYPE_IPV4);
                plain.extend_from_slice(&ip.octets());
            }
            Address::Ip(std::net::IpAddr::V6(ip)) => {
                plain.push(ADDR_TYPE_IPV6);
                plain.extend_from_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let len = u8::try_from(domain.len())
                    .ok()
                    .filter(|len| *len > 0)
                    .ok_or_else(|| Error::Protocol(format!("invalid domain length: {}", domain.len())))?;
                plain.push(ADDR_TYPE_DOMAIN);
                plain.push(len);
                plain.extend_from_slice(domain.as_bytes());
            }
        }
        let checksum = fnv1a32(&plain);
        plain.extend_from_slice(&checksum.to_be_bytes());

        let mut cipher = new_encryptor(header.user.id.cmd_key(), &timestamp_iv(timestamp))?;
        cipher.encrypt(&mut plain);

        let mut wire = Vec::with_capacity(16 + plain.len());
        wire.extend_from_slice(&id.token(timestamp)?);
        wire.extend_from_slice(&plain);
        Ok(wire)
    }

    /// Wrap `writer` to encrypt the request body.
    pub fn encode_request_body<W>(&self, writer: W) -> Result<CryptionWriter<W>> {
        Ok(CryptionWriter::new(
            writer,
            new_encryptor(&self.request_body_key, &self.request_body_iv)?,
        ))
    }

    /// Read and verify the response header; the returned reader yields the
    /// decrypted response body.
    ///
    /// A malformed or unknown command is logged and ignored.
    pub async fn decode_response_header<R>(
        &self,
        reader: R,
    ) -> Result<(ResponseHeader, CryptionReader<R>)>
    where
        R: AsyncRead + Unpin,
    {
        let cipher = new_decryptor(&self.response_body_key, &self.response_body_iv)?;
        let mut reader = CryptionReader::new(reader, cipher);

        let mut head = [0u8; 4];
        reader.read_exact(&mut head).await?;
        if head[0] != self.response_header {
            warn!("VMess out: unexpected response header, the connection is probably hijacked");
            return Err(Error::InvalidResponse);
        }

        let mut response = ResponseHeader::default();
        let (cmd_id, cmd_len) = (head[2], head[3] as usize);
        if cmd_id != 0 {
            let mut data = vec![0u8; cmd_len];
            reader.read_exact(&mut data).await?;
            match ResponseCommand::unmarshal(cmd_id, &data) {
                Ok(command) => {
                    debug!("VMess out: received command {:?}", command);
                    response.command = Some(command);
                }
                Err(e) => warn!("VMess out: ignoring response command: {}", e),
            }
        }
        Ok((response, reader))
    }
}

impl Default for ClientSession {
    fn default() -> Self {
        Self::new()
    }
}
