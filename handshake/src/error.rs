//! Handshake error taxonomy (spec.md §7 "Handshake").

error_chain! {
    types {
        HandshakeError, HandshakeErrorKind, HandshakeResultExt, HandshakeResult;
    }

    foreign_links {
        Io(std::io::Error);
    }

    errors {
        ProxyRejected {
            description("proxy did not return a success reply to CONNECT")
        }
        BadProtocolString {
            description("peer's protocol string did not match and no custom protocol was accepted")
        }
        SelfConnection {
            description("remote peer-id matches our own — connected to ourselves")
        }
        InfoHashUnknown {
            description("responder does not recognise the offered info-hash")
        }
        EncryptionRequired {
            description("require_rc4 is set and the peer did not offer rc4")
        }
        MessageTooLarge {
            length: usize
        } {
            description("framed message length exceeds the protocol maximum")
            display("message length {} exceeds the maximum", length)
        }
        Timeout {
            description("handshake did not complete within its deadline")
        }
        UnexpectedEof {
            description("connection closed before the handshake completed")
        }
    }
}
