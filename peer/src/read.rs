//! Read state machine (spec.md §4.H): `{idle, length, type, msg,
//! read-bitfield, read-piece, skip-piece, internal-error}`. Grounded on
//! `bip_peer::message::mod`'s length-then-id framing, generalized here into
//! an explicit incremental state machine instead of the teacher's
//! re-invoke-the-whole-parser-on-every-read approach, so piece payloads can
//! stream straight into a sink without ever sitting fully buffered in
//! memory (spec.md "streams bytes straight into the writable chunk").

use bytes::{Buf, BytesMut};

use tcore_util::bitfield::Bitfield;
use tcore_util::bt::PieceIndex;

use crate::error::{PeerError, PeerErrorKind};
use crate::message::Message;

const HEADER_LEN: usize = 4;
const BITFIELD_ID: u8 = 5;
const PIECE_ID: u8 = 7;

/// What the owner of an in-progress piece transfer decides to do with a
/// freshly-started `piece` message (spec.md "when leader ... when
/// non-leader, compares bytes to leader and either silently skips or ...
/// abandons this transfer").
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PieceDisposition {
    Accept,
    Skip,
}

/// Destination for piece bytes as they stream in, decoupling the byte
/// framing in this module from chunk storage and leader/non-leader
/// coordination (implemented by `crate::requests::RequestList`).
pub trait PieceSink {
    fn begin_piece(&mut self, index: PieceIndex, begin: u32, length: u32) -> PieceDisposition;
    fn write_block(&mut self, index: PieceIndex, offset: u32, bytes: &[u8]);
    fn finish_piece(&mut self, index: PieceIndex, begin: u32);
}

/// Events the read state machine surfaces to the owning connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request { index: PieceIndex, begin: u32, length: u32 },
    PieceComplete { index: PieceIndex, begin: u32 },
    Cancel { index: PieceIndex, begin: u32, length: u32 },
    Extension { id: u8, payload: Vec<u8> },
}

enum Phase {
    AwaitingLength,
    AwaitingType { len: u32 },
    AwaitingBody { len: u32 },
    ReadBitfield { remaining: usize, collected: Vec<u8> },
    ReadPiece { index: PieceIndex, begin: u32, offset: u32, remaining: usize },
    SkipPiece { remaining: usize },
    InternalError,
}

pub struct ReadMachine {
    phase: Phase,
    buf: BytesMut,
    num_pieces: usize,
}

impl ReadMachine {
    pub fn new(num_pieces: usize) -> ReadMachine {
        ReadMachine { phase: Phase::AwaitingLength, buf: BytesMut::new(), num_pieces }
    }

    pub fn feed(&mut self, data: &[u8], sink: &mut dyn PieceSink) -> Result<Vec<Event>, PeerError> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        let result = self.drain(sink, &mut events);
        if result.is_err() {
            self.phase = Phase::InternalError;
        }
        result?;
        Ok(events)
    }

    fn drain(&mut self, sink: &mut dyn PieceSink, events: &mut Vec<Event>) -> Result<(), PeerError> {
        loop {
            match &mut self.phase {
                Phase::InternalError => return Err(PeerErrorKind::ProtocolViolation("read machine is in an error state".to_string()).into()),

                Phase::AwaitingLength => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(());
                    }
                    let len = self.buf.get_u32();
                    if len == 0 {
                        events.push(Event::KeepAlive);
                        continue;
                    }
                    if len > Message::MAX_MESSAGE_LEN {
                        return Err(PeerErrorKind::MessageTooLarge(len).into());
                    }
                    self.phase = Phase::AwaitingType { len };
                }

                Phase::AwaitingType { len } => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    let len = *len;
                    let id = self.buf[0];

                    if id == PIECE_ID {
                        if (len as usize) < 9 {
                            return Err(PeerErrorKind::MalformedMessage.into());
                        }
                        if self.buf.len() < 9 {
                            return Ok(());
                        }
                        let _id_byte = self.buf.get_u8();
                        let index = self.buf.get_u32();
                        let begin = self.buf.get_u32();
                        let remaining = len as usize - 9;

                        self.phase = match sink.begin_piece(index, begin, remaining as u32) {
                            PieceDisposition::Accept => Phase::ReadPiece { index, begin, offset: 0, remaining },
                            PieceDisposition::Skip => Phase::SkipPiece { remaining },
                        };
                    } else if id == BITFIELD_ID {
                        if len < 1 {
                            return Err(PeerErrorKind::MalformedMessage.into());
                        }
                        let _id_byte = self.buf.get_u8();
                        let remaining = len as usize - 1;
                        self.phase = Phase::ReadBitfield { remaining, collected: Vec::with_capacity(remaining) };
                    } else {
                        self.phase = Phase::AwaitingBody { len };
                    }
                }

                Phase::AwaitingBody { len } => {
                    let len = *len as usize;
                    if self.buf.len() < len {
                        return Ok(());
                    }
                    let body = self.buf.split_to(len);
                    let message = Message::from_body(len as u32, &body)?;
                    self.phase = Phase::AwaitingLength;

                    match message {
                        Message::KeepAlive => events.push(Event::KeepAlive),
                        Message::Choke => events.push(Event::Choke),
                        Message::Unchoke => events.push(Event::Unchoke),
                        Message::Interested => events.push(Event::Interested),
                        Message::NotInterested => events.push(Event::NotInterested),
                        Message::Have(index) => events.push(Event::Have(index)),
                        Message::Request { index, begin, length } => events.push(Event::Request { index, begin, length }),
                        Message::Cancel { index, begin, length } => events.push(Event::Cancel { index, begin, length }),
                        Message::Extension { id, payload } => events.push(Event::Extension { id, payload }),
                        Message::Piece { .. } => unreachable!("piece messages are routed through ReadPiece/SkipPiece, never AwaitingBody"),
                        Message::Bitfield(_) => unreachable!("bitfield messages are routed through ReadBitfield, never AwaitingBody"),
                    }
                }

                Phase::ReadBitfield { remaining, collected } => {
                    let take = (*remaining).min(self.buf.len());
                    if take == 0 && *remaining > 0 {
                        return Ok(());
                    }
                    collected.extend_from_slice(&self.buf.split_to(take));
                    *remaining -= take;
                    if *remaining == 0 {
                        let bitfield = Bitfield::from_wire_bytes(collected, self.num_pieces);
                        events.push(Event::Bitfield(bitfield));
                        self.phase = Phase::AwaitingLength;
                    } else {
                        return Ok(());
                    }
                }

                Phase::ReadPiece { index, begin, offset, remaining } => {
                    if *remaining == 0 {
                        let (index, begin) = (*index, *begin);
                        sink.finish_piece(index, begin);
                        events.push(Event::PieceComplete { index, begin });
                        self.phase = Phase::AwaitingLength;
                        continue;
                    }
                    let take = (*remaining).min(self.buf.len());
                    if take == 0 {
                        return Ok(());
                    }
                    let chunk = self.buf.split_to(take);
                    sink.write_block(*index, *begin + *offset, &chunk);
                    *offset += take as u32;
                    *remaining -= take;
                }

                Phase::SkipPiece { remaining } => {
                    let take = (*remaining).min(self.buf.len());
                    if take == 0 && *remaining > 0 {
                        return Ok(());
                    }
                    self.buf.advance(take);
                    *remaining -= take;
                    if *remaining == 0 {
                        self.phase = Phase::AwaitingLength;
                    } else {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingSink {
        blocks: Vec<(PieceIndex, u32, Vec<u8>)>,
        disposition: PieceDisposition,
    }

    impl PieceSink for CollectingSink {
        fn begin_piece(&mut self, _index: PieceIndex, _begin: u32, _length: u32) -> PieceDisposition {
            self.disposition
        }
        fn write_block(&mut self, index: PieceIndex, offset: u32, bytes: &[u8]) {
            self.blocks.push((index, offset, bytes.to_vec()));
        }
        fn finish_piece(&mut self, _index: PieceIndex, _begin: u32) {}
    }

    #[test]
    fn positive_choke_unchoke_sequence() {
        let mut machine = ReadMachine::new(4);
        let mut sink = CollectingSink { blocks: Vec::new(), disposition: PieceDisposition::Accept };

        let mut bytes = Vec::new();
        Message::Choke.write_bytes(&mut bytes);
        Message::Unchoke.write_bytes(&mut bytes);

        let events = machine.feed(&bytes, &mut sink).unwrap();
        assert_eq!(events, vec![Event::Choke, Event::Unchoke]);
    }

    #[test]
    fn positive_piece_streams_into_sink_without_full_buffering() {
        let mut machine = ReadMachine::new(4);
        let mut sink = CollectingSink { blocks: Vec::new(), disposition: PieceDisposition::Accept };

        let mut bytes = Vec::new();
        Message::Piece { index: 2, begin: 0, block: vec![1, 2, 3, 4, 5] }.write_bytes(&mut bytes);

        // Feed byte-by-byte to prove partial reads are handled.
        let mut events = Vec::new();
        for byte in &bytes {
            events.extend(machine.feed(std::slice::from_ref(byte), &mut sink).unwrap());
        }

        assert_eq!(sink.blocks.iter().map(|(_, _, b)| b.clone()).flatten().collect::<Vec<u8>>(), vec![1, 2, 3, 4, 5]);
        assert!(events.iter().any(|e| matches!(e, Event::PieceComplete { index: 2, begin: 0 })));
    }

    #[test]
    fn positive_skipped_piece_is_discarded() {
        let mut machine = ReadMachine::new(4);
        let mut sink = CollectingSink { blocks: Vec::new(), disposition: PieceDisposition::Skip };

        let mut bytes = Vec::new();
        Message::Piece { index: 0, begin: 0, block: vec![9, 9, 9] }.write_bytes(&mut bytes);
        Message::Choke.write_bytes(&mut bytes);

        let events = machine.feed(&bytes, &mut sink).unwrap();
        assert!(sink.blocks.is_empty());
        assert_eq!(events, vec![Event::PieceComplete { index: 0, begin: 0 }, Event::Choke]);
    }

    #[test]
    fn negative_oversized_length_is_fatal() {
        let mut machine = ReadMachine::new(4);
        let mut sink = CollectingSink { blocks: Vec::new(), disposition: PieceDisposition::Accept };

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(Message::MAX_MESSAGE_LEN + 1).to_be_bytes());

        assert!(machine.feed(&bytes, &mut sink).is_err());
    }
}
