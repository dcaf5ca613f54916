use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{big_integer, integer, pk_auto, string, timestamp};

/// Group-call change events other than the initial setup.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "d_callstream_groupcall_status_change")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub db_id: i64,
    pub call_id: i64,
    pub timeout: i32,
    pub seq_no: i32,
    pub received_at: DateTime,
    pub message_id: i32,
    pub action_id: i32,
    pub group_ssi: i64,
    pub group_mnc: i32,
    pub group_mcc: i32,
    pub group_esn: String,
    pub group_descr: String,
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
                    .col(integer(Column::Timeout))
                    .col(integer(Column::SeqNo))
                    .col(timestamp(Column::ReceivedAt))
                    .col(integer(Column::MessageId))
                    .col(integer(Column::ActionId))
                    .col(big_integer(Column::GroupSsi))
                    .col(integer(Column::GroupMnc))
                    .col(integer(Column::GroupMcc))
                    .col(string(Column::GroupEsn).char_len(32))
                    .col(string(Column::GroupDescr).char_len(128))
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
