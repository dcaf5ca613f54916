use sea_orm::entity::prelude::*;
use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::{big_integer, blob, string, timestamp, timestamp_null};

/// Materialized voice recording of an individual call, one row per call row.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "d_callstream_voiceindicall")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub db_id: i64,
    pub call_begin: DateTime,
    pub call_end: Option<DateTime>,
    pub voice_data_len: i64,
    #[sea_orm(column_type = "Blob")]
    pub voice_data: Vec<u8>,
    /// Rendered as `H:M:S.mmm`.
    pub duration: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::indicall::Entity",
        from = "Column::DbId",
        to = "super::indicall::Column::DbId",
        on_delete = "Cascade",
        on_update = "Cascade"
    )]
    Call,
}

impl Related<super::indicall::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Call.def()
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
                    .col(
                        sea_orm_migration::prelude::ColumnDef::new(Column::DbId)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(timestamp(Column::CallBegin))
                    .col(timestamp_null(Column::CallEnd))
                    .col(big_integer(Column::VoiceDataLen))
                    .col(blob(Column::VoiceData))
                    .col(string(Column::Duration).char_len(32))
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
