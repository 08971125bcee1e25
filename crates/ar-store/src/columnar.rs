//! Arrow representation of observed data.

use std::sync::Arc;

use ar_types::{ArError, ArResult, Data, Observation};
use arrow::array::{
    Array, ArrayRef, Float64Array, StringArray, TimestampMillisecondArray, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;

pub const TRIAL_INDEX: &str = "trial_index";
pub const ARM_NAME: &str = "arm_name";
pub const METRIC: &str = "metric";
pub const MEAN: &str = "mean";
pub const SEM: &str = "sem";
pub const STEP: &str = "step";
pub const RECORDED_AT: &str = "recorded_at";

/// Schema of the observation table.
pub fn observation_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(TRIAL_INDEX, DataType::UInt64, false),
        Field::new(ARM_NAME, DataType::Utf8, false),
        Field::new(METRIC, DataType::Utf8, false),
        Field::new(MEAN, DataType::Float64, false),
        Field::new(SEM, DataType::Float64, true),
        Field::new(STEP, DataType::UInt64, true),
        Field::new(
            RECORDED_AT,
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
    ]))
}

fn arrow_error(e: impl std::fmt::Display) -> ArError {
    ArError::Arrow(e.to_string())
}

/// Convert data to a single record batch.
pub fn data_to_record_batch(data: &Data) -> ArResult<RecordBatch> {
    let observations = data.observations();

    let trial_indices: Vec<u64> = observations.iter().map(|o| o.trial_index as u64).collect();
    let arm_names: Vec<&str> = observations.iter().map(|o| o.arm_name.as_str()).collect();
    let metrics: Vec<&str> = observations.iter().map(|o| o.metric.as_str()).collect();
    let means: Vec<f64> = observations.iter().map(|o| o.mean).collect();
    let sems: Vec<Option<f64>> = observations.iter().map(|o| o.sem).collect();
    let steps: Vec<Option<u64>> = observations.iter().map(|o| o.step).collect();
    let recorded: Vec<i64> = observations
        .iter()
        .map(|o| o.recorded_at.timestamp_millis())
        .collect();

    let arrays: Vec<ArrayRef> = vec![
        Arc::new(UInt64Array::from(trial_indices)),
        Arc::new(StringArray::from(arm_names)),
        Arc::new(StringArray::from(metrics)),
        Arc::new(Float64Array::from(means)),
        Arc::new(Float64Array::from(sems)),
        Arc::new(UInt64Array::from(steps)),
        Arc::new(TimestampMillisecondArray::from(recorded).with_timezone("UTC")),
    ];

    RecordBatch::try_new(observation_schema(), arrays).map_err(arrow_error)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> ArResult<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| arrow_error(format!("missing column {name}")))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| arrow_error(format!("column {name} has an unexpected type")))
}

/// Append the rows of `batch` to `data`.
pub fn extend_from_record_batch(data: &mut Data, batch: &RecordBatch) -> ArResult<()> {
    let trial_indices = column::<UInt64Array>(batch, TRIAL_INDEX)?;
    let arm_names = column::<StringArray>(batch, ARM_NAME)?;
    let metrics = column::<StringArray>(batch, METRIC)?;
    let means = column::<Float64Array>(batch, MEAN)?;
    let sems = column::<Float64Array>(batch, SEM)?;
    let steps = column::<UInt64Array>(batch, STEP)?;
    let recorded = column::<TimestampMillisecondArray>(batch, RECORDED_AT)?;

    for i in 0..batch.num_rows() {
        if trial_indices.is_null(i) || arm_names.is_null(i) || metrics.is_null(i) || means.is_null(i) {
            return Err(arrow_error(format!("row {i} is missing a required value")));
        }
        let recorded_at = DateTime::from_timestamp_millis(recorded.value(i))
            .ok_or_else(|| arrow_error(format!("row {i} has an invalid timestamp")))?;

        data.push(Observation {
            trial_index: trial_indices.value(i) as usize,
            arm_name: arm_names.value(i).to_string(),
            metric: metrics.value(i).to_string(),
            mean: means.value(i),
            sem: (!sems.is_null(i)).then(|| sems.value(i)),
            step: (!steps.is_null(i)).then(|| steps.value(i)),
            recorded_at,
        });
    }
    Ok(())
}
