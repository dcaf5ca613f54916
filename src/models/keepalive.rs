use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{integer, string, timestamp};

/// Log-server heartbeat, upserted by log server number.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "d_callstream_keepalive")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub log_server_no: i32,
    pub last_heartbeat: DateTime,
    pub timeout: i32,
    pub sw_ver: String,
    pub sw_ver_string: String,
    pub log_server_descr: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        sea_orm_migration::prelude::ColumnDef::new(Column::LogServerNo)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(timestamp(Column::LastHeartbeat))
                    .col(integer(Column::Timeout))
                    .col(string(Column::SwVer).char_len(16))
                    .col(string(Column::SwVerString).char_len(32))
                    .col(string(Column::LogServerDescr).char_len(128))
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Entity).to_owned())
            .await
    }
}
