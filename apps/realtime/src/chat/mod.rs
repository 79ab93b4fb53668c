pub mod api;
pub mod models;
pub mod session;

pub use api::{ChatApi, HttpChatApi};
pub use models::{ChatRoom, Message, RoomMessage, Side};
pub use session::{ChatRoomSession, Cursor, RoomState};
