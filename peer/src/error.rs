//! Peer-connection error taxonomy (spec.md §7 "Input/validation" and the
//! read state machine's "Failure semantics").

error_chain! {
    types {
        PeerError, PeerErrorKind, PeerResultExt, PeerResult;
    }

    foreign_links {
        Io(std::io::Error);
    }

    errors {
        MalformedMessage {
            description("message failed to parse against its declared length")
        }
        UnknownMessageId(id: u8) {
            description("message id is not part of the wire protocol")
            display("unknown message id {}", id)
        }
        MessageTooLarge(length: u32) {
            description("message length exceeds the protocol maximum")
            display("message length {} exceeds the maximum of {}", length, crate::message::Message::MAX_MESSAGE_LEN)
        }
        InvalidPiece {
            description("request referenced a piece index or block range we do not have or do not own")
        }
        RemoteClosed {
            description("remote peer closed the connection")
        }
        ProtocolViolation(reason: String) {
            description("peer violated the wire protocol")
            display("protocol violation: {}", reason)
        }
    }
}
