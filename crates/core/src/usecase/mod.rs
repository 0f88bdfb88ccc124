pub mod ambience;
pub mod playback;
pub mod resolver;
pub mod story_player;
pub mod story_service;
