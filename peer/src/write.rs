//! Write state machine (spec.md §4.H): `{idle, msg, write-piece,
//! internal-error}`. An outgoing command queue drains into a fixed-size
//! write buffer; once it's empty and an upload request is queued, the
//! connection streams the requested block straight out of the chunk
//! (encrypting through an intermediate buffer for encrypted sessions)
//! instead of first copying it into a `Message::Piece`.

use std::collections::VecDeque;

use crate::message::Message;

/// Size of the plain command write-buffer (spec.md "512-byte write
/// buffer").
const WRITE_BUFFER_LEN: usize = 512;

/// Source for a block this connection is currently uploading, so the write
/// machine never needs the whole block resident as a `Vec<u8>` at once.
pub trait BlockSource {
    /// Total number of bytes left to stream for the in-progress block.
    fn remaining(&self) -> usize;
    /// Read up to `out.len()` bytes at the current stream position,
    /// advancing it, returning the number of bytes written.
    fn read_into(&mut self, out: &mut [u8]) -> usize;
}

/// Optional in-place transform applied to bytes as they leave the write
/// buffer (RC4 keystream XOR for encrypted sessions); `None` for plaintext.
pub trait OutgoingCipher {
    fn apply(&mut self, bytes: &mut [u8]);
}

enum Phase {
    Idle,
    Msg { buffer: Vec<u8>, written: usize },
    WritePiece { header: Vec<u8>, header_written: usize },
    InternalError,
}

/// What the connection owner should do with the bytes `poll_write` hands
/// back.
pub enum WriteOutcome {
    /// Nothing to send right now.
    Idle,
    /// Bytes ready to hand to the socket.
    Bytes(Vec<u8>),
}

pub struct WriteMachine {
    phase: Phase,
    commands: VecDeque<Message>,
    /// Set by `begin_piece_upload`; only taken up once `commands` has fully
    /// drained, so a piece queued for upload never jumps ahead of a choke
    /// or have message already waiting to go out.
    pending_piece: Option<(u32, u32, u32)>,
}

impl WriteMachine {
    pub fn new() -> WriteMachine {
        WriteMachine { phase: Phase::Idle, commands: VecDeque::new(), pending_piece: None }
    }

    pub fn queue_command(&mut self, message: Message) {
        self.commands.push_back(message);
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// True once the command queue has drained and no upload is in
    /// progress or pending.
    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle) && self.commands.is_empty() && self.pending_piece.is_none()
    }

    /// Queue an upload's block for streaming once the command queue drains
    /// (spec.md "when the buffer drains and an upload request is queued,
    /// the connection transitions to write-piece"). At most one piece
    /// upload is pending at a time; a second call replaces the first.
    pub fn begin_piece_upload(&mut self, index: u32, begin: u32, length: u32) {
        self.pending_piece = Some((index, begin, length));
    }

    fn start_pending_piece(&mut self) {
        if let Some((index, begin, length)) = self.pending_piece.take() {
            let mut header = Vec::with_capacity(13);
            header.extend_from_slice(&(9 + length).to_be_bytes());
            header.push(7);
            header.extend_from_slice(&index.to_be_bytes());
            header.extend_from_slice(&begin.to_be_bytes());
            self.phase = Phase::WritePiece { header, header_written: 0 };
        }
    }

    /// Produce the next chunk of bytes to write to the socket. Called
    /// repeatedly by the connection's poll loop; `source` is only consulted
    /// while in `WritePiece`.
    pub fn poll_write(&mut self, source: &mut dyn BlockSource, cipher: Option<&mut dyn OutgoingCipher>) -> WriteOutcome {
        match &mut self.phase {
            Phase::InternalError => WriteOutcome::Idle,

            Phase::Idle => {
                if let Some(command) = self.commands.pop_front() {
                    let mut buffer = Vec::new();
                    command.write_bytes(&mut buffer);
                    self.phase = Phase::Msg { buffer, written: 0 };
                    self.poll_write(source, cipher)
                } else if self.pending_piece.is_some() {
                    self.start_pending_piece();
                    self.poll_write(source, cipher)
                } else {
                    WriteOutcome::Idle
                }
            }

            Phase::Msg { buffer, written } => {
                let remaining = &buffer[*written..];
                let take = remaining.len().min(WRITE_BUFFER_LEN);
                let mut out = remaining[..take].to_vec();
                *written += take;
                if *written >= buffer.len() {
                    self.phase = Phase::Idle;
                }
                if let Some(cipher) = cipher {
                    cipher.apply(&mut out);
                }
                WriteOutcome::Bytes(out)
            }

            Phase::WritePiece { header, header_written } => {
                if *header_written < header.len() {
                    let remaining = &header[*header_written..];
                    let take = remaining.len().min(WRITE_BUFFER_LEN);
                    let mut out = remaining[..take].to_vec();
                    *header_written += take;
                    if let Some(cipher) = cipher {
                        cipher.apply(&mut out);
                    }
                    return WriteOutcome::Bytes(out);
                }

                if source.remaining() == 0 {
                    self.phase = Phase::Idle;
                    return self.poll_write(source, cipher);
                }

                let mut buf = vec![0u8; WRITE_BUFFER_LEN.min(source.remaining())];
                let n = source.read_into(&mut buf);
                buf.truncate(n);
                if let Some(cipher) = cipher {
                    cipher.apply(&mut buf);
                }
                if source.remaining() == 0 {
                    self.phase = Phase::Idle;
                }
                WriteOutcome::Bytes(buf)
            }
        }
    }
}

impl Default for WriteMachine {
    fn default() -> WriteMachine {
        WriteMachine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        data: Vec<u8>,
        position: usize,
    }

    impl BlockSource for FixedSource {
        fn remaining(&self) -> usize {
            self.data.len() - self.position
        }
        fn read_into(&mut self, out: &mut [u8]) -> usize {
            let take = self.remaining().min(out.len());
            out[..take].copy_from_slice(&self.data[self.position..self.position + take]);
            self.position += take;
            take
        }
    }

    #[test]
    fn positive_queued_commands_drain_before_piece_upload_starts() {
        let mut machine = WriteMachine::new();
        machine.queue_command(Message::Unchoke);
        machine.begin_piece_upload(0, 0, 4);

        let mut source = FixedSource { data: vec![1, 2, 3, 4], position: 0 };

        let first = match machine.poll_write(&mut source, None) {
            WriteOutcome::Bytes(bytes) => bytes,
            WriteOutcome::Idle => panic!("expected the queued unchoke first"),
        };
        let mut expected = Vec::new();
        Message::Unchoke.write_bytes(&mut expected);
        assert_eq!(first, expected);

        let header = match machine.poll_write(&mut source, None) {
            WriteOutcome::Bytes(bytes) => bytes,
            WriteOutcome::Idle => panic!("expected the piece header next"),
        };
        assert_eq!(header[4], 7, "piece message id");

        let body = match machine.poll_write(&mut source, None) {
            WriteOutcome::Bytes(bytes) => bytes,
            WriteOutcome::Idle => panic!("expected the block body"),
        };
        assert_eq!(body, vec![1, 2, 3, 4]);
    }

    #[test]
    fn positive_idle_with_nothing_queued() {
        let mut machine = WriteMachine::new();
        let mut source = FixedSource { data: vec![], position: 0 };
        assert!(matches!(machine.poll_write(&mut source, None), WriteOutcome::Idle));
    }
}
