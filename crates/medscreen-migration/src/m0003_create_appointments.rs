use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Appointments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Appointments::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Appointments::PatientId).big_integer().not_null())
                    .col(ColumnDef::new(Appointments::DoctorId).big_integer().not_null())
                    .col(
                        ColumnDef::new(Appointments::CreatedByUserId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Appointments::AppointmentDate)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Appointments::DurationMinutes)
                            .integer()
                            .not_null()
                            .default(30),
                    )
                    .col(
                        ColumnDef::new(Appointments::AppointmentType)
                            .string_len(20)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Appointments::Status)
                            .string_len(20)
                            .not_null()
                            .default("scheduled"),
                    )
                    .col(ColumnDef::new(Appointments::Notes).text().null())
                    .col(
                        ColumnDef::new(Appointments::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Appointments::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_appointments_patient")
                            .from(Appointments::Table, Appointments::PatientId)
                            .to(Patients::Table, Patients::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_appointments_doctor_date")
                    .table(Appointments::Table)
                    .col(Appointments::DoctorId)
                    .col(Appointments::AppointmentDate)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Appointments::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Appointments {
    Table,
    Id,
    PatientId,
    DoctorId,
    CreatedByUserId,
    AppointmentDate,
    DurationMinutes,
    AppointmentType,
    Status,
    Notes,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Patients {
    Table,
    Id,
}
