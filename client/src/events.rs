//! Events a node reports to whoever drives it (terminal UI, tests)

use crate::files::{CompletedFile, FileOffer, TransferStatus};
use crate::game::{GameOutcome, Move, Symbol};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    PeerDiscovered {
        user_id: String,
        display_name: String,
    },
    ProfileUpdated {
        user_id: String,
        display_name: String,
        status: String,
    },
    PeerLost {
        user_id: String,
    },
    /// Peer list received from the rendezvous server
    Welcomed {
        peers: Vec<(String, String)>,
    },
    PostReceived {
        author: String,
        message_id: String,
        content: String,
    },
    PostLiked {
        from: String,
        post_timestamp: String,
    },
    DirectMessage {
        from: String,
        message_id: String,
        content: String,
    },
    Followed {
        follower: String,
    },
    Unfollowed {
        follower: String,
    },
    FileOffered {
        from: String,
        offer: FileOffer,
    },
    FileReceived(CompletedFile),
    /// Outgoing file settled by the recipient's FILE_RECEIVED
    FileDelivered {
        file_id: String,
        status: TransferStatus,
    },
    FileIgnored {
        file_id: String,
    },
    FileFailed {
        file_id: String,
    },
    GameInvited {
        game_id: String,
        from: String,
        symbol: Symbol,
    },
    GameMoved {
        game_id: String,
        mv: Move,
    },
    GameOver {
        game_id: String,
        outcome: GameOutcome,
    },
    GroupJoined {
        group_id: String,
        name: String,
        members: Vec<String>,
    },
    GroupUpdated {
        group_id: String,
        members: Vec<String>,
    },
    GroupMessage {
        group_id: String,
        from: String,
        content: String,
    },
    DeliveryFailed {
        message_id: String,
        to: String,
    },
    TokenRevoked {
        token: String,
    },
}
