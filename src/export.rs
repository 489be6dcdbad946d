// src/export.rs
use std::io::Write;
use thiserror::Error;

use crate::views::{format_amount, LedgerTotals, WorkerRow};

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to flush CSV output: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV output is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

const HEADER: [&str; 18] = [
    "工号",
    "姓名",
    "状态",
    "点工天数",
    "加班天数",
    "点工金额",
    "包工",
    "工量",
    "短工",
    "工资",
    "借支",
    "扣款",
    "公司转账",
    "结算",
    "支出",
    "未结",
    "开始日期",
    "结束日期",
];

/// Worker view as CSV: one line per employee and a closing total line.
pub fn write_worker_csv<W: Write>(
    rows: &[WorkerRow],
    totals: &LedgerTotals,
    writer: W,
) -> Result<(), ExportError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(HEADER)?;

    for row in rows {
        let (earliest, latest) = match row.date_range {
            Some(range) => (range.earliest.to_string(), range.latest.to_string()),
            None => (String::new(), String::new()),
        };
        csv_writer.write_record([
            row.emp_code.as_str(),
            row.emp_name.as_str(),
            row.status,
            row.regular_days.as_str(),
            row.overtime_days.as_str(),
            row.point_work_amount.as_str(),
            row.contract_amount.as_str(),
            row.quantity_amount.as_str(),
            row.short_term_amount.as_str(),
            row.salary.as_str(),
            row.advance.as_str(),
            row.deduction.as_str(),
            row.company_transfer.as_str(),
            row.settlement_payment.as_str(),
            row.expense.as_str(),
            row.unsettled.as_str(),
            earliest.as_str(),
            latest.as_str(),
        ])?;
    }

    let (earliest, latest) = match totals.date_range {
        Some(range) => (range.earliest.to_string(), range.latest.to_string()),
        None => (String::new(), String::new()),
    };
    csv_writer.write_record([
        "合计".to_string(),
        format!("{}人", totals.employee_count),
        String::new(),
        format!("{:.2}", totals.regular_days),
        format!("{:.2}", totals.overtime_days),
        format_amount(totals.point_work_amount),
        format_amount(totals.contract_amount),
        format_amount(totals.quantity_amount),
        format_amount(totals.short_term_amount),
        format_amount(totals.salary),
        format_amount(totals.advance),
        format_amount(totals.deduction),
        format_amount(totals.company_transfer),
        format_amount(totals.settlement_payment),
        format_amount(totals.expense),
        format_amount(totals.unsettled),
        earliest,
        latest,
    ])?;
    csv_writer.flush()?;
    Ok(())
}

pub fn worker_csv_string(rows: &[WorkerRow], totals: &LedgerTotals) -> Result<String, ExportError> {
    let mut buffer = Vec::new();
    write_worker_csv(rows, totals, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::DateRange;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn test_csv_has_header_rows_and_total() {
        let range = DateRange {
            earliest: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            latest: NaiveDate::from_ymd_opt(2024, 5, 3).unwrap(),
        };
        let row = WorkerRow {
            emp_code: "1".to_string(),
            emp_name: "张三".to_string(),
            status: "在职",
            regular_days: "1.25".to_string(),
            overtime_days: "0.00".to_string(),
            point_work_amount: "187".to_string(),
            contract_amount: "0".to_string(),
            quantity_amount: "0".to_string(),
            short_term_amount: "0".to_string(),
            salary: "187".to_string(),
            advance: "200".to_string(),
            deduction: "0".to_string(),
            company_transfer: "0".to_string(),
            settlement_payment: "0".to_string(),
            expense: "200".to_string(),
            unsettled: "-13".to_string(),
            date_range: Some(range),
        };
        let totals = LedgerTotals {
            employee_count: 1,
            regular_days: dec!(1.25),
            salary: dec!(187),
            expense: dec!(200),
            unsettled: dec!(-13),
            date_range: Some(range),
            ..Default::default()
        };

        let csv = worker_csv_string(&[row], &totals).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("工号,姓名,状态"));
        assert_eq!(
            lines[1],
            "1,张三,在职,1.25,0.00,187,0,0,0,187,200,0,0,0,200,-13,2024-05-01,2024-05-03"
        );
        assert!(lines[2].starts_with("合计,1人,,1.25,0.00,0,"));
        assert!(lines[2].ends_with(",-13,2024-05-01,2024-05-03"));
    }
}
