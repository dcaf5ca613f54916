use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{big_integer, integer, pk_auto, timestamp};

/// Push-to-talk transitions of a simplex call.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "d_callstream_indicall_ptt")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub db_id: i64,
    pub call_id: i64,
    pub seq_no: i32,
    pub received_at: DateTime,
    pub talking_party: i32,
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
                    .col(pk_auto(Column::DbId).big_integer())
                    .col(big_integer(Column::CallId))
                    .col(integer(Column::SeqNo))
                    .col(timestamp(Column::ReceivedAt))
                    .col(integer(Column::TalkingParty))
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
