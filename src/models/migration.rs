use sea_orm_migration::{MigrationTrait, MigratorTrait};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(super::keepalive::Migration),
            Box::new(super::indicall::Migration),
            Box::new(super::indicall_status_change::Migration),
            Box::new(super::indicall_ptt::Migration),
            Box::new(super::groupcall::Migration),
            Box::new(super::groupcall_status_change::Migration),
            Box::new(super::groupcall_ptt::Migration),
            Box::new(super::voiceindicall::Migration),
            Box::new(super::voicegroupcall::Migration),
            Box::new(super::sdsstatus::Migration),
            Box::new(super::sdsdata::Migration),
        ]
    }
}
