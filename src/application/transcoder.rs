use crate::domain::jobs::Job;
use crate::ports::SegmentProducer;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Init,
    Segment,
}

/// Runs blocking segment production off the async runtime.
///
/// At most `max_concurrent_jobs` transcodes run at once; further requests
/// wait for a permit.
pub struct TranscodeService<P> {
    producer: Arc<P>,
    permits: Arc<Semaphore>,
}

impl<P> Clone for TranscodeService<P> {
    fn clone(&self) -> Self {
        Self {
            producer: self.producer.clone(),
            permits: self.permits.clone(),
        }
    }
}

impl<P> TranscodeService<P>
where
    P: SegmentProducer + 'static,
{
    pub fn new(producer: P, max_concurrent_jobs: usize) -> Self {
        Self {
            producer: Arc::new(producer),
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        }
    }

    pub async fn init_segment(&self, job: Job) -> Bytes {
        self.run(job, Output::Init).await
    }

    pub async fn segment(&self, job: Job) -> Bytes {
        self.run(job, Output::Segment).await
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    async fn run(&self, job: Job, output: Output) -> Bytes {
        // 1. Wait for a free slot
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!(error = %e, "transcode permits closed");
                return Bytes::new();
            }
        };

        // 2. Transcode on the blocking pool, holding the permit until done
        let producer = self.producer.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match output {
                Output::Init => producer.produce_init_segment(&job),
                Output::Segment => producer.produce_segment(&job),
            }
        })
        .await;

        match result {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                tracing::error!(error = %e, "transcode task panicked");
                Bytes::new()
            }
        }
    }
}
