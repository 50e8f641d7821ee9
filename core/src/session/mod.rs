// Session recording, replay and file conversion
mod format;
mod player;
mod recorder;

pub use format::{
    convert, load_session, read_db, read_log, save_session, write_db, write_log, LoadedSession,
    SessionFormat,
};
pub use player::{PlaybackState, PlayerStatus, SessionPlayer};
pub use recorder::{RecorderState, RecorderStatus, SessionFiles, SessionRecorder};
