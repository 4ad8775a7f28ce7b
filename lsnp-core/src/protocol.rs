//! LSNP wire protocol: transport constants, message kinds and field names.

use std::fmt;

use crate::token::Scope;

/// Fixed UDP port every peer binds and sends to.
pub const LSNP_PORT: u16 = 50999;

/// Largest datagram the transport carries (and the receive buffer size).
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// Field names shared by several message kinds.
pub mod field {
    pub const TYPE: &str = "TYPE";
    pub const MESSAGE_ID: &str = "MESSAGE_ID";
    pub const FROM: &str = "FROM";
    pub const TO: &str = "TO";
    pub const USER_ID: &str = "USER_ID";
    pub const USER: &str = "USER";
    pub const TIMESTAMP: &str = "TIMESTAMP";
    pub const TOKEN: &str = "TOKEN";
    pub const SCOPE: &str = "SCOPE";
    pub const EXPIRY: &str = "EXPIRY";
    pub const STATUS: &str = "STATUS";
    pub const DISPLAY_NAME: &str = "DISPLAY_NAME";
    pub const AVATAR_TYPE: &str = "AVATAR_TYPE";
    pub const AVATAR_ENCODING: &str = "AVATAR_ENCODING";
    pub const AVATAR_DATA: &str = "AVATAR_DATA";
    pub const CONTENT: &str = "CONTENT";
    pub const TTL: &str = "TTL";
    pub const FILEID: &str = "FILEID";
    pub const FILENAME: &str = "FILENAME";
    pub const FILESIZE: &str = "FILESIZE";
    pub const FILETYPE: &str = "FILETYPE";
    pub const DESCRIPTION: &str = "DESCRIPTION";
    pub const CHUNK_INDEX: &str = "CHUNK_INDEX";
    pub const TOTAL_CHUNKS: &str = "TOTAL_CHUNKS";
    pub const CHUNK_SIZE: &str = "CHUNK_SIZE";
    pub const DATA: &str = "DATA";
}

/// Every message kind the dispatcher knows how to route. Anything else is `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Profile,
    Ping,
    Post,
    Like,
    Dm,
    Follow,
    Unfollow,
    GroupCreate,
    GroupUpdate,
    GroupMessage,
    FileOffer,
    FileAccept,
    FileReject,
    FileChunk,
    FileReceived,
    TokenRequest,
    TokenReply,
    Revoke,
    GameInvite,
    GameMove,
    GameResult,
    Ack,
    Other(String),
}

impl MessageKind {
    /// Parse a `TYPE` value. Matching is exact except for the legacy aliases
    /// `FILE_IGNORED` (reject) and `TOKEN_REVOKE` (revoke).
    pub fn parse(tag: &str) -> Self {
        match tag {
            "PROFILE" => Self::Profile,
            "PING" => Self::Ping,
            "POST" => Self::Post,
            "LIKE" => Self::Like,
            "DM" => Self::Dm,
            "FOLLOW" => Self::Follow,
            "UNFOLLOW" => Self::Unfollow,
            "GROUP_CREATE" => Self::GroupCreate,
            "GROUP_UPDATE" => Self::GroupUpdate,
            "GROUP_MESSAGE" => Self::GroupMessage,
            "FILE_OFFER" => Self::FileOffer,
            "FILE_ACCEPT" => Self::FileAccept,
            "FILE_REJECT" | "FILE_IGNORED" => Self::FileReject,
            "FILE_CHUNK" => Self::FileChunk,
            "FILE_RECEIVED" => Self::FileReceived,
            "TOKEN_REQUEST" => Self::TokenRequest,
            "TOKEN_REPLY" => Self::TokenReply,
            "REVOKE" | "TOKEN_REVOKE" => Self::Revoke,
            "TICTACTOE_INVITE" => Self::GameInvite,
            "TICTACTOE_MOVE" => Self::GameMove,
            "TICTACTOE_RESULT" => Self::GameResult,
            "ACK" => Self::Ack,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Profile => "PROFILE",
            Self::Ping => "PING",
            Self::Post => "POST",
            Self::Like => "LIKE",
            Self::Dm => "DM",
            Self::Follow => "FOLLOW",
            Self::Unfollow => "UNFOLLOW",
            Self::GroupCreate => "GROUP_CREATE",
            Self::GroupUpdate => "GROUP_UPDATE",
            Self::GroupMessage => "GROUP_MESSAGE",
            Self::FileOffer => "FILE_OFFER",
            Self::FileAccept => "FILE_ACCEPT",
            Self::FileReject => "FILE_REJECT",
            Self::FileChunk => "FILE_CHUNK",
            Self::FileReceived => "FILE_RECEIVED",
            Self::TokenRequest => "TOKEN_REQUEST",
            Self::TokenReply => "TOKEN_REPLY",
            Self::Revoke => "REVOKE",
            Self::GameInvite => "TICTACTOE_INVITE",
            Self::GameMove => "TICTACTOE_MOVE",
            Self::GameResult => "TICTACTOE_RESULT",
            Self::Ack => "ACK",
            Self::Other(tag) => tag,
        }
    }

    /// Whether the receiver must answer with an ACK (also for retransmissions).
    pub fn requires_ack(&self) -> bool {
        matches!(
            self,
            Self::Dm
                | Self::Like
                | Self::Follow
                | Self::Unfollow
                | Self::GroupCreate
                | Self::GroupUpdate
                | Self::GroupMessage
                | Self::GameInvite
                | Self::GameMove
                | Self::GameResult
                | Self::FileOffer
                | Self::FileAccept
                | Self::FileReject
                | Self::FileReceived
        )
    }

    /// Token scope an incoming message of this kind must carry, if it is gated.
    pub fn required_scope(&self) -> Option<Scope> {
        match self {
            Self::Post | Self::Like => Some(Scope::Broadcast),
            Self::Dm => Some(Scope::Chat),
            Self::Follow | Self::Unfollow => Some(Scope::Follow),
            Self::GroupCreate | Self::GroupUpdate | Self::GroupMessage => Some(Scope::Group),
            Self::GameInvite | Self::GameMove | Self::GameResult => Some(Scope::Game),
            Self::FileOffer | Self::FileChunk => Some(Scope::File),
            _ => None,
        }
    }

    /// Kinds whose business logic lives outside the core and is reached via registered handlers.
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            Self::Post
                | Self::Like
                | Self::Dm
                | Self::Follow
                | Self::Unfollow
                | Self::GroupCreate
                | Self::GroupUpdate
                | Self::GroupMessage
                | Self::GameInvite
                | Self::GameMove
                | Self::GameResult
                | Self::Other(_)
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
