// One module per puzzle task. Each exposes `TASK` and an async `run`.

pub mod categories;
pub mod censor;
pub mod connections;
pub mod database;
pub mod gps;
pub mod json_fix;
pub mod login;
pub mod loop_search;
pub mod map;
pub mod mp3;
pub mod notes;
pub mod phone;
pub mod photos;
pub mod poligon;
pub mod research;
pub mod robotid;
pub mod softo;
pub mod timelock;
pub mod verify;
