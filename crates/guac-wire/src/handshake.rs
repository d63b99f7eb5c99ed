//! Connect handshake for the tunneled remote-desktop protocol.
//!
//! Runs once per session, before raw relay begins. The tunnel sends a
//! `select` naming the sub-protocol, waits for the server's `args`
//! instruction, answers with `size`/`audio`/`video`/`image`/`connect`, and
//! from then on passes every decoded instruction through untouched. The
//! exchange stays inside this module; the relay never sees it.

use std::collections::HashMap;

use crate::framer::{Framer, FramingError, Instruction};

pub const DEFAULT_WIDTH: &str = "1024";
pub const DEFAULT_HEIGHT: &str = "768";
pub const DEFAULT_DPI: &str = "96";

const AUDIO_MIMETYPES: [&str; 1] = ["audio/L16"];
const IMAGE_MIMETYPES: [&str; 2] = ["image/png", "image/jpeg"];

/// What the tunnel wants done with the remote end's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// Send this wire text back to the remote-desktop endpoint.
    Send(String),
    /// Hand this instruction to the session consumer, unmodified.
    Deliver(Instruction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingArgs,
    Ready,
}

/// Framing plus handshake state for one remote-desktop session.
pub struct Tunnel {
    framer: Framer,
    phase: Phase,
    params: HashMap<String, String>,
}

impl Tunnel {
    /// Build a tunnel for `protocol` with caller-supplied connection
    /// parameters. Returns the tunnel and the `select` wire text that must
    /// be sent to the remote end to start the exchange.
    pub fn new(protocol: &str, params: HashMap<String, String>) -> (Self, String) {
        let select = Instruction::new("select", [protocol]).encode();
        (
            Self {
                framer: Framer::new(),
                phase: Phase::AwaitingArgs,
                params,
            },
            select,
        )
    }

    /// True once the connect exchange has completed.
    pub fn ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Feed a fragment of remote output through the framer and handshake.
    pub fn feed(&mut self, fragment: &str) -> Result<Vec<TunnelEvent>, FramingError> {
        let mut events = Vec::new();
        for instruction in self.framer.feed(fragment)? {
            match self.phase {
                Phase::AwaitingArgs => {
                    if instruction.opcode == "args" {
                        events.push(TunnelEvent::Send(self.negotiate(&instruction.args)));
                        self.phase = Phase::Ready;
                    }
                    // Anything else before `args` belongs to the handshake
                    // and stays local.
                }
                Phase::Ready => events.push(TunnelEvent::Deliver(instruction)),
            }
        }
        Ok(events)
    }

    /// Answer an `args` instruction: advertise display and media support,
    /// then `connect` with one value per requested parameter name.
    /// Version-tagged names are echoed unchanged.
    fn negotiate(&self, requested: &[String]) -> String {
        let size = Instruction::new(
            "size",
            [
                self.param_or("width", DEFAULT_WIDTH),
                self.param_or("height", DEFAULT_HEIGHT),
                self.param_or("dpi", DEFAULT_DPI),
            ],
        );
        let audio = Instruction::new("audio", AUDIO_MIMETYPES);
        let video = Instruction::new("video", [] as [&str; 0]);
        let image = Instruction::new("image", IMAGE_MIMETYPES);

        let connect_args: Vec<String> = requested
            .iter()
            .map(|name| {
                if name.starts_with("VERSION_") {
                    name.clone()
                } else {
                    self.params.get(name).cloned().unwrap_or_default()
                }
            })
            .collect();
        let connect = Instruction::new("connect", connect_args);

        let mut out = size.encode();
        out.push_str(&audio.encode());
        out.push_str(&video.encode());
        out.push_str(&image.encode());
        out.push_str(&connect.encode());
        out
    }

    fn param_or(&self, key: &str, default: &str) -> String {
        self.params
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}
