use crate::error::BrokerError;
use crate::guacd::{InstructionReader, InstructionWriter};
use log::debug;
use sandgate_common::protocol::{Instruction, WireError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

pub const DEFAULT_WIDTH: u32 = 800;
pub const DEFAULT_HEIGHT: u32 = 600;
const DPI: &str = "96";

/// Parameter name under which the gateway expects the id of an existing
/// connection to join instead of a fresh value.
pub const JOIN_PARAMETER: &str = "GUAC_ID";

/// Everything the handshake needs to describe one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub protocol: String,
    pub parameters: HashMap<String, String>,
    pub optimal_width: u32,
    pub optimal_height: u32,
    pub audio_mimetypes: Vec<String>,
    pub image_mimetypes: Vec<String>,
    /// Set on the share path to join an existing display.
    pub join_connection_id: Option<String>,
}

impl ConnectionConfig {
    /// Builds a config from a stored parameter snapshot. `scheme` selects
    /// the protocol; `width`/`height` parse with 800x600 fallbacks and are
    /// never swapped.
    pub fn from_params(params: &HashMap<String, String>) -> Self {
        let protocol = params.get("scheme").cloned().unwrap_or_default();
        let optimal_width = parse_dimension(params.get("width").map(String::as_str), DEFAULT_WIDTH);
        let optimal_height =
            parse_dimension(params.get("height").map(String::as_str), DEFAULT_HEIGHT);

        Self {
            protocol,
            parameters: params.clone(),
            optimal_width,
            optimal_height,
            audio_mimetypes: vec![
                "audio/L16".to_string(),
                "rate=44100".to_string(),
                "channels=2".to_string(),
            ],
            image_mimetypes: vec!["image/png".to_string(), "image/jpeg".to_string()],
            join_connection_id: None,
        }
    }

    /// Copy safe to log: the password is redacted on shared sessions and
    /// the join id is dropped otherwise.
    pub fn sanitized(&self, share: bool) -> Self {
        let mut copy = self.clone();
        if share {
            if let Some(password) = copy.parameters.get_mut("password") {
                *password = "********".to_string();
            }
        } else {
            copy.join_connection_id = None;
        }
        copy
    }
}

/// Accepts decimal strings; parse failures and zero fall back to the
/// given default.
pub fn parse_dimension(value: Option<&str>, default: u32) -> u32 {
    match value.and_then(|v| v.parse::<u32>().ok()) {
        Some(0) | None => default,
        Some(n) => n,
    }
}

/// Runs the select/size/audio/video/image/connect exchange and returns the
/// gateway-assigned tunnel id, all under the caller's deadline.
pub async fn handshake<R, W>(
    reader: &mut InstructionReader<R>,
    writer: &mut InstructionWriter<W>,
    config: &ConnectionConfig,
    deadline: Duration,
) -> Result<String, BrokerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::time::timeout(deadline, exchange(reader, writer, config))
        .await
        .map_err(|_| BrokerError::Timeout("gateway handshake".to_string()))?
}

async fn exchange<R, W>(
    reader: &mut InstructionReader<R>,
    writer: &mut InstructionWriter<W>,
    config: &ConnectionConfig,
) -> Result<String, BrokerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write(writer, Instruction::of("select", vec![config.protocol.clone()])).await?;

    let args = read(reader).await?;
    if args.opcode() != "args" {
        return Err(BrokerError::HandshakeFailed(format!(
            "expected args, gateway sent {}",
            args.opcode()
        )));
    }
    debug!("gateway expects {} connection arguments", args.args().len());

    write(
        writer,
        Instruction::of(
            "size",
            vec![
                config.optimal_width.to_string(),
                config.optimal_height.to_string(),
                DPI.to_string(),
            ],
        ),
    )
    .await?;
    write(writer, Instruction::of("audio", config.audio_mimetypes.clone())).await?;
    write(writer, Instruction::of("video", Vec::new())).await?;
    write(writer, Instruction::of("image", config.image_mimetypes.clone())).await?;

    let values: Vec<String> = args
        .args()
        .iter()
        .map(|name| {
            if name == JOIN_PARAMETER {
                config.join_connection_id.clone().unwrap_or_default()
            } else {
                config.parameters.get(name).cloned().unwrap_or_default()
            }
        })
        .collect();
    write(writer, Instruction::of("connect", values)).await?;

    let ready = read(reader).await?;
    if ready.opcode() != "ready" {
        return Err(BrokerError::HandshakeFailed(format!(
            "expected ready, gateway sent {}",
            ready.opcode()
        )));
    }

    ready
        .args()
        .first()
        .cloned()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            BrokerError::HandshakeFailed("gateway sent ready without a tunnel id".to_string())
        })
}

async fn read<R: AsyncRead + Unpin>(
    reader: &mut InstructionReader<R>,
) -> Result<Instruction, BrokerError> {
    reader.read_instruction().await.map_err(wire_error)
}

async fn write<W: AsyncWrite + Unpin>(
    writer: &mut InstructionWriter<W>,
    instruction: Instruction,
) -> Result<(), BrokerError> {
    writer.write_instruction(&instruction).await.map_err(wire_error)
}

fn wire_error(err: WireError) -> BrokerError {
    match err {
        WireError::ShortRead => BrokerError::Timeout("gateway read".to_string()),
        other => BrokerError::HandshakeFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, duplex, split};

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn dimensions_parse_with_defaults() {
        assert_eq!(parse_dimension(Some("1920"), DEFAULT_WIDTH), 1920);
        assert_eq!(parse_dimension(Some("0"), DEFAULT_WIDTH), DEFAULT_WIDTH);
        assert_eq!(parse_dimension(Some("abc"), DEFAULT_WIDTH), DEFAULT_WIDTH);
        assert_eq!(parse_dimension(None, DEFAULT_HEIGHT), DEFAULT_HEIGHT);
    }

    #[test]
    fn width_and_height_are_not_swapped() {
        let config =
            ConnectionConfig::from_params(&params(&[("width", "1280"), ("height", "720")]));
        assert_eq!(config.optimal_width, 1280);
        assert_eq!(config.optimal_height, 720);
    }

    #[test]
    fn sanitized_redacts_password_on_shared_sessions() {
        let mut config = ConnectionConfig::from_params(&params(&[("password", "hunter2")]));
        config.join_connection_id = Some("$5".to_string());

        let shared = config.sanitized(true);
        assert_eq!(
            shared.parameters.get("password").map(String::as_str),
            Some("********")
        );
        assert_eq!(shared.join_connection_id.as_deref(), Some("$5"));

        let private = config.sanitized(false);
        assert_eq!(
            private.parameters.get("password").map(String::as_str),
            Some("hunter2")
        );
        assert!(private.join_connection_id.is_none());
    }

    /// Scripted gateway: answers `select` with an `args` list, checks the
    /// client side of the exchange, then emits `ready`.
    async fn fake_gateway(
        stream: tokio::io::DuplexStream,
        arg_names: Vec<&'static str>,
        tunnel_id: &'static str,
    ) -> Vec<Instruction> {
        let (read_half, write_half) = split(stream);
        let mut reader = InstructionReader::new(read_half, Duration::from_secs(5));
        let mut writer = InstructionWriter::new(write_half);

        let select = reader.read_instruction().await.unwrap();
        assert_eq!(select.opcode(), "select");

        let args: Vec<String> = arg_names.iter().map(|s| s.to_string()).collect();
        writer
            .write_instruction(&Instruction::of("args", args))
            .await
            .unwrap();

        let mut seen = vec![select];
        for _ in 0..5 {
            let instruction = reader.read_instruction().await.unwrap();
            let done = instruction.opcode() == "connect";
            seen.push(instruction);
            if done {
                break;
            }
        }

        writer
            .write_instruction(&Instruction::of("ready", vec![tunnel_id.to_string()]))
            .await
            .unwrap();
        seen
    }

    #[tokio::test]
    async fn full_exchange_returns_tunnel_id() {
        let (broker_side, gateway_side) = duplex(4096);
        let gateway = tokio::spawn(fake_gateway(
            gateway_side,
            vec!["hostname", "port", "password", JOIN_PARAMETER],
            "$deadbeef",
        ));

        let (read_half, write_half) = split(broker_side);
        let mut reader = InstructionReader::new(read_half, Duration::from_secs(5));
        let mut writer = InstructionWriter::new(write_half);

        let config = ConnectionConfig::from_params(&params(&[
            ("scheme", "rdp"),
            ("hostname", "sandbox-1.svc"),
            ("port", "3389"),
            ("password", "secret"),
            ("width", "1024"),
            ("height", "768"),
        ]));

        let tunnel_id = handshake(&mut reader, &mut writer, &config, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(tunnel_id, "$deadbeef");

        let seen = gateway.await.unwrap();
        assert_eq!(seen[0].args(), &["rdp"]);
        assert_eq!(seen[1].opcode(), "size");
        assert_eq!(seen[1].args(), &["1024", "768", "96"]);
        assert_eq!(seen[2].opcode(), "audio");
        assert_eq!(seen[3].opcode(), "video");
        assert!(seen[3].args().is_empty());
        assert_eq!(seen[4].opcode(), "image");
        assert_eq!(seen[4].args(), &["image/png", "image/jpeg"]);

        let connect = &seen[5];
        assert_eq!(connect.opcode(), "connect");
        // values line up with the advertised argument names; the join slot
        // stays empty for a primary connection
        assert_eq!(connect.args(), &["sandbox-1.svc", "3389", "secret", ""]);
    }

    #[tokio::test]
    async fn join_slot_carries_the_owner_tunnel_id() {
        let (broker_side, gateway_side) = duplex(4096);
        let gateway = tokio::spawn(fake_gateway(
            gateway_side,
            vec![JOIN_PARAMETER, "hostname"],
            "$2",
        ));

        let (read_half, write_half) = split(broker_side);
        let mut reader = InstructionReader::new(read_half, Duration::from_secs(5));
        let mut writer = InstructionWriter::new(write_half);

        let mut config = ConnectionConfig::from_params(&params(&[
            ("scheme", "rdp"),
            ("hostname", "sandbox-1.svc"),
        ]));
        config.join_connection_id = Some("$owner".to_string());

        let tunnel_id = handshake(&mut reader, &mut writer, &config, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(tunnel_id, "$2");

        let seen = gateway.await.unwrap();
        let connect = seen.last().unwrap();
        assert_eq!(connect.args(), &["$owner", "sandbox-1.svc"]);
    }

    #[tokio::test]
    async fn silent_gateway_times_out() {
        let (broker_side, gateway_side) = duplex(4096);

        let (read_half, write_half) = split(broker_side);
        let mut reader = InstructionReader::new(read_half, Duration::from_secs(30));
        let mut writer = InstructionWriter::new(write_half);

        let config = ConnectionConfig::from_params(&params(&[("scheme", "rdp")]));
        let result = handshake(
            &mut reader,
            &mut writer,
            &config,
            Duration::from_millis(50),
        )
        .await;

        match result {
            Err(BrokerError::Timeout(_)) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        drop(gateway_side);
    }

    #[tokio::test]
    async fn unexpected_opcode_fails_handshake() {
        let (broker_side, gateway_side) = duplex(4096);

        let gateway = tokio::spawn(async move {
            let (read_half, write_half) = split(gateway_side);
            let mut reader = InstructionReader::new(read_half, Duration::from_secs(5));
            let mut writer = InstructionWriter::new(write_half);
            let _ = reader.read_instruction().await.unwrap();
            writer
                .write_instruction(&Instruction::of("error", vec!["no such protocol".to_string()]))
                .await
                .unwrap();
            let mut inner = writer.into_inner();
            let _ = inner.shutdown().await;
        });

        let (read_half, write_half) = split(broker_side);
        let mut reader = InstructionReader::new(read_half, Duration::from_secs(5));
        let mut writer = InstructionWriter::new(write_half);

        let config = ConnectionConfig::from_params(&params(&[("scheme", "vnc")]));
        let result = handshake(&mut reader, &mut writer, &config, Duration::from_secs(5)).await;

        match result {
            Err(BrokerError::HandshakeFailed(msg)) => assert!(msg.contains("error")),
            other => panic!("expected HandshakeFailed, got {other:?}"),
        }
        gateway.await.unwrap();
    }
}
