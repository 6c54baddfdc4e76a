//! Queries for discovered/downloaded PDF documents.

use anyhow::Result;
use sqlx::Row;

use goodmeasure_core::types::{DocumentType, ExtractionStatus, PdfRecord, TransferStatus};

use crate::Store;

impl Store {
    pub async fn upsert_pdf(&self, pdf: &PdfRecord) -> Result<()> {
        let extracted = pdf
            .extracted_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"INSERT INTO pdf_documents
                   (charity_ein, source_url, document_type, fiscal_year, file_path,
                    file_hash, download_status, extraction_status, extracted_data)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT (charity_ein, source_url) DO UPDATE SET
                   document_type = excluded.document_type,
                   fiscal_year = excluded.fiscal_year,
                   file_path = excluded.file_path,
                   file_hash = excluded.file_hash,
                   download_status = excluded.download_status,
                   extraction_status = excluded.extraction_status,
                   extracted_data = excluded.extracted_data"#,
        )
        .bind(&pdf.charity_ein)
        .bind(&pdf.source_url)
        .bind(pdf.document_type.as_str())
        .bind(pdf.fiscal_year)
        .bind(&pdf.file_path)
        .bind(&pdf.file_hash)
        .bind(status_str(pdf.download_status))
        .bind(extraction_str(pdf.extraction_status))
        .bind(extracted)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Dedup check: a PDF with the same content hash is already stored for
    /// this charity (possibly under a different URL).
    pub async fn pdf_hash_exists(&self, ein: &str, file_hash: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS x FROM pdf_documents WHERE charity_ein = ?1 AND file_hash = ?2 LIMIT 1",
        )
        .bind(ein)
        .bind(file_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    pub async fn pdfs_for_charity(&self, ein: &str) -> Result<Vec<PdfRecord>> {
        let rows = sqlx::query(
            r#"SELECT charity_ein, source_url, document_type, fiscal_year, file_path,
                      file_hash, download_status, extraction_status, extracted_data
               FROM pdf_documents WHERE charity_ein = ?1"#,
        )
        .bind(ein)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|r| {
                let extracted: Option<String> = r.get("extracted_data");
                Ok(PdfRecord {
                    charity_ein: r.get("charity_ein"),
                    source_url: r.get("source_url"),
                    document_type: doc_type_from(r.get::<String, _>("document_type").as_str()),
                    fiscal_year: r.get("fiscal_year"),
                    file_path: r.get("file_path"),
                    file_hash: r.get("file_hash"),
                    download_status: status_from(r.get::<String, _>("download_status").as_str()),
                    extraction_status: extraction_from(
                        r.get::<String, _>("extraction_status").as_str(),
                    ),
                    extracted_data: extracted.map(|s| serde_json::from_str(&s)).transpose()?,
                })
            })
            .collect()
    }
}

fn status_str(s: TransferStatus) -> &'static str {
    match s {
        TransferStatus::Pending => "pending",
        TransferStatus::Downloading => "downloading",
        TransferStatus::Completed => "completed",
        TransferStatus::Failed => "failed",
    }
}

fn status_from(s: &str) -> TransferStatus {
    match s {
        "downloading" => TransferStatus::Downloading,
        "completed" => TransferStatus::Completed,
        "failed" => TransferStatus::Failed,
        _ => TransferStatus::Pending,
    }
}

fn extraction_str(s: ExtractionStatus) -> &'static str {
    match s {
        ExtractionStatus::Pending => "pending",
        ExtractionStatus::InProgress => "in_progress",
        ExtractionStatus::Completed => "completed",
        ExtractionStatus::Failed => "failed",
    }
}

fn extraction_from(s: &str) -> ExtractionStatus {
    match s {
        "in_progress" => ExtractionStatus::InProgress,
        "completed" => ExtractionStatus::Completed,
        "failed" => ExtractionStatus::Failed,
        _ => ExtractionStatus::Pending,
    }
}

fn doc_type_from(s: &str) -> DocumentType {
    match s {
        "form_990" => DocumentType::Form990,
        "audit_report" => DocumentType::AuditReport,
        "financial_statement" => DocumentType::FinancialStatement,
        "impact_report" => DocumentType::ImpactReport,
        "evaluation_report" => DocumentType::EvaluationReport,
        "theory_of_change" => DocumentType::TheoryOfChange,
        "annual_report" => DocumentType::AnnualReport,
        "program_report" => DocumentType::ProgramReport,
        "strategic_plan" => DocumentType::StrategicPlan,
        "governance" => DocumentType::Governance,
        _ => DocumentType::Other,
    }
}
