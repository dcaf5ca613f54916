use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{big_integer, integer, pk_auto, string, timestamp};

/// Individual-call change events other than the initial setup
/// (through-connect, keep-alive, A/B user change).
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "d_callstream_indicall_status_change")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub db_id: i64,
    pub call_id: i64,
    pub seq_no: i32,
    pub received_at: DateTime,
    pub action_id: i32,
    pub timeout: i32,
    pub calling_ssi: i64,
    pub calling_mnc: i32,
    pub calling_mcc: i32,
    pub calling_esn: String,
    pub calling_descr: String,
    pub called_ssi: i64,
    pub called_mnc: i32,
    pub called_mcc: i32,
    pub called_esn: String,
    pub called_descr: String,
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
                    .col(integer(Column::ActionId))
                    .col(integer(Column::Timeout))
                    .col(big_integer(Column::CallingSsi))
                    .col(integer(Column::CallingMnc))
                    .col(integer(Column::CallingMcc))
                    .col(string(Column::CallingEsn).char_len(32))
                    .col(string(Column::CallingDescr).char_len(128))
                    .col(big_integer(Column::CalledSsi))
                    .col(integer(Column::CalledMnc))
                    .col(integer(Column::CalledMcc))
                    .col(string(Column::CalledEsn).char_len(32))
                    .col(string(Column::CalledDescr).char_len(128))
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
