use std::fs::File;
use std::path::{Path, PathBuf};

use ar_experiment::Experiment;
use ar_types::{validation_error, ArError, ArResult, Data};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::columnar::{data_to_record_batch, extend_from_record_batch, observation_schema};

pub const EXPERIMENT_FILE: &str = "experiment.json";
pub const DATA_FILE: &str = "data.parquet";

fn parquet_error(e: impl std::fmt::Display) -> ArError {
    ArError::Parquet(e.to_string())
}

/// Directory-per-experiment store.
///
/// ```text
/// <root>/<experiment>/experiment.json   full experiment snapshot
/// <root>/<experiment>/data.parquet      every observation, one row each
/// ```
#[derive(Debug, Clone)]
pub struct ExperimentStore {
    root: PathBuf,
}

impl ExperimentStore {
    pub fn new<P: AsRef<Path>>(root: P) -> ArResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one experiment's files.
    pub fn experiment_dir(&self, name: &str) -> ArResult<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
        {
            return Err(validation_error!("Experiment name {:?} cannot be used as a directory", name));
        }
        Ok(self.root.join(name))
    }

    /// Write the experiment snapshot and its data. Returns the directory.
    pub fn save_experiment(&self, experiment: &Experiment) -> ArResult<PathBuf> {
        let dir = self.experiment_dir(experiment.name())?;
        std::fs::create_dir_all(&dir)?;

        self.write_json(&dir.join(EXPERIMENT_FILE), experiment)?;
        let data = experiment.fetch_data();
        self.write_parquet(&dir.join(DATA_FILE), &data)?;

        info!(
            "Saved experiment {} ({} trials, {} observations) to {}",
            experiment.name(),
            experiment.num_trials(),
            data.len(),
            dir.display()
        );
        Ok(dir)
    }

    pub fn load_experiment(&self, name: &str) -> ArResult<Experiment> {
        let path = self.experiment_dir(name)?.join(EXPERIMENT_FILE);
        let experiment: Experiment = self.read_json(&path)?;
        debug!("Loaded experiment {} from {}", name, path.display());
        Ok(experiment)
    }

    /// Overwrite the Parquet data of an experiment.
    pub fn save_data(&self, name: &str, data: &Data) -> ArResult<PathBuf> {
        let dir = self.experiment_dir(name)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(DATA_FILE);
        self.write_parquet(&path, data)?;
        Ok(path)
    }

    pub fn load_data(&self, name: &str) -> ArResult<Data> {
        let path = self.experiment_dir(name)?.join(DATA_FILE);
        let file = File::open(&path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(parquet_error)?
            .build()
            .map_err(parquet_error)?;

        let mut data = Data::new();
        for batch in reader {
            let batch = batch.map_err(|e| ArError::Arrow(e.to_string()))?;
            extend_from_record_batch(&mut data, &batch)?;
        }
        debug!("Loaded {} observations from {}", data.len(), path.display());
        Ok(data)
    }

    /// Write any serializable artifact (e.g. a run summary) next to an
    /// experiment.
    pub fn save_artifact<T: Serialize>(&self, name: &str, file_name: &str, value: &T) -> ArResult<PathBuf> {
        let dir = self.experiment_dir(name)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        self.write_json(&path, value)?;
        Ok(path)
    }

    /// Names of all experiments with a snapshot in the store.
    pub fn list_experiments(&self) -> ArResult<Vec<String>> {
        let mut names = Vec::new();
        if !self.root.exists() {
            return Ok(names);
        }

        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.join(EXPERIMENT_FILE).is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete_experiment(&self, name: &str) -> ArResult<bool> {
        let dir = self.experiment_dir(name)?;
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        info!("Deleted experiment {} from the store", name);
        Ok(true)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> ArResult<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, value)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> ArResult<T> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    fn write_parquet(&self, path: &Path, data: &Data) -> ArResult<()> {
        let batch = data_to_record_batch(data)?;
        let file = File::create(path)?;
        let props = WriterProperties::builder().build();
        let mut writer =
            ArrowWriter::try_new(file, observation_schema(), Some(props)).map_err(parquet_error)?;
        writer.write(&batch).map_err(parquet_error)?;
        writer.close().map_err(parquet_error)?;
        Ok(())
    }
}
