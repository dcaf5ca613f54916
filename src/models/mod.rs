pub mod groupcall;
pub mod groupcall_ptt;
pub mod groupcall_status_change;
pub mod indicall;
pub mod indicall_ptt;
pub mod indicall_status_change;
pub mod keepalive;
pub mod migration;
pub mod sdsdata;
pub mod sdsstatus;
pub mod voicegroupcall;
pub mod voiceindicall;

pub use migration::Migrator;
