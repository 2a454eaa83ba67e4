use tokio::runtime::{Builder, Runtime};

pub struct RuntimeBuilder {
    flavor: String,
    worker_threads: Option<usize>,
    max_blocking_threads: usize,
}

impl RuntimeBuilder {
    pub fn create() -> Self {
        let flavor = std::env::var("TOKIO_FLAVOR").unwrap_or_else(|_| "multi_thread".to_string());

        let worker_threads: Option<usize> = std::env::var("TOKIO_WORKER_THREADS")
            .ok()
            .and_then(|v| v.parse().ok());

        let max_blocking_threads: usize = std::env::var("TOKIO_MAX_BLOCKING_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(32);

        Self {
            flavor,
            worker_threads,
            max_blocking_threads,
        }
    }

    pub fn build(self) -> anyhow::Result<Runtime> {
        let mut builder = match self.flavor.as_str() {
            "current_thread" => Builder::new_current_thread(),
            "multi_thread" | "multi" | "" => Builder::new_multi_thread(),
            other => {
                eprintln!("invalid TOKIO_FLAVOR={other:?}; using multi_thread");
                Builder::new_multi_thread()
            }
        };

        if self.flavor != "current_thread" {
            if let Some(worker_threads) = self.worker_threads {
                builder.worker_threads(worker_threads);
            }
        }

        builder
            .max_blocking_threads(self.max_blocking_threads)
            .enable_all();

        Ok(builder.build()?)
    }
}
