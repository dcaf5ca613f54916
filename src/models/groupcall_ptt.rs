use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{
    big_integer, big_integer_null, integer, integer_null, pk_auto, string_null, timestamp,
};

/// Push-to-talk transitions of a group call. Active transitions carry the
/// talking party identity, idle transitions leave those columns null.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "d_callstream_groupcall_ptt")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub db_id: i64,
    pub call_id: i64,
    pub seq_no: i32,
    pub received_at: DateTime,
    pub message_id: i32,
    pub tp_ssi: Option<i64>,
    pub tp_mnc: Option<i32>,
    pub tp_mcc: Option<i32>,
    pub tp_esn: Option<String>,
    pub tp_descr: Option<String>,
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
                    .col(integer(Column::MessageId))
                    .col(big_integer_null(Column::TpSsi))
                    .col(integer_null(Column::TpMnc))
                    .col(integer_null(Column::TpMcc))
                    .col(string_null(Column::TpEsn).char_len(32))
                    .col(string_null(Column::TpDescr).char_len(128))
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
