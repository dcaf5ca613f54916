use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{
    big_integer, integer, integer_null, pk_auto, string, timestamp, timestamp_null,
};

/// One row per individual (duplex or simplex) call, opened by the setup
/// event and closed in place by the release event.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "d_callstream_indicall")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = true)]
    pub db_id: i64,
    pub call_id: i64,
    pub timeout: i32,
    pub call_begin: DateTime,
    pub call_end: Option<DateTime>,
    pub seq_no_begin: i32,
    pub seq_no_end: Option<i32>,
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
    /// 1 for duplex, 0 for simplex.
    pub simplex_duplex: i32,
    pub disconnect_cause: Option<i32>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::voiceindicall::Entity")]
    Voice,
}

impl Related<super::voiceindicall::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Voice.def()
    }
}

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
                    .col(timestamp(Column::CallBegin))
                    .col(timestamp_null(Column::CallEnd))
                    .col(integer(Column::SeqNoBegin))
                    .col(integer_null(Column::SeqNoEnd))
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
                    .col(integer(Column::SimplexDuplex))
                    .col(integer_null(Column::DisconnectCause))
                    .to_owned(),
            )
            .await?;
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_indicall_call_id")
                    .table(Entity)
                    .col(Column::CallId)
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
