use std::sync::Arc;

use actix::Addr;

use crate::chat_core::ChatCore;
use crate::chat_server::ChatServer;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub chat_server: Addr<ChatServer>,
    pub core: Arc<ChatCore>,
    pub config: Config,
}
