use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Patients::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Patients::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Patients::UserId).big_integer().null())
                    .col(ColumnDef::new(Patients::FirstName).string_len(100).not_null())
                    .col(ColumnDef::new(Patients::LastName).string_len(100).not_null())
                    .col(ColumnDef::new(Patients::TcNumber).string_len(11).not_null())
                    .col(ColumnDef::new(Patients::BirthDate).date().not_null())
                    .col(ColumnDef::new(Patients::Gender).string_len(10).not_null())
                    .col(ColumnDef::new(Patients::Phone).string_len(20).not_null())
                    .col(ColumnDef::new(Patients::Email).string_len(100).null())
                    .col(ColumnDef::new(Patients::Address).text().null())
                    .col(
                        ColumnDef::new(Patients::EmergencyContactName)
                            .string_len(100)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Patients::EmergencyContactPhone)
                            .string_len(20)
                            .null(),
                    )
                    .col(ColumnDef::new(Patients::BloodType).string_len(5).null())
                    .col(ColumnDef::new(Patients::Height).double().null())
                    .col(ColumnDef::new(Patients::Weight).double().null())
                    .col(ColumnDef::new(Patients::PrimaryDoctorId).big_integer().null())
                    .col(
                        ColumnDef::new(Patients::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Patients::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_patients_primary_doctor")
                            .from(Patients::Table, Patients::PrimaryDoctorId)
                            .to(Users::Table, Users::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .index(
                        Index::create()
                            .name("idx_patients_tc_number_unique")
                            .table(Patients::Table)
                            .col(Patients::TcNumber)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_patients_last_name")
                    .table(Patients::Table)
                    .col(Patients::LastName)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Patients::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Patients {
    Table,
    Id,
    UserId,
    FirstName,
    LastName,
    TcNumber,
    BirthDate,
    Gender,
    Phone,
    Email,
    Address,
    EmergencyContactName,
    EmergencyContactPhone,
    BloodType,
    Height,
    Weight,
    PrimaryDoctorId,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Users {
    Table,
    Id,
}
