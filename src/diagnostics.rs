//! GPU timing.
//!
//! [`GpuTimer`] brackets a unit of work with two timestamp queries inside a
//! disjoint query and waits for the results. It is an instrumentation aid: the
//! wait is a polling loop, unlike every resource operation in the crate.

use crate::backend::{QueryData, QueryId, QueryKind};
use crate::device::Device;
use crate::error::{ComputeError, ComputeResult};

/// Result of one [`GpuTimer::measure`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuTiming {
    pub elapsed_micros: f64,
    /// `false` when the device changed state (clock, power, reset) during the
    /// measurement; the elapsed time is then meaningless.
    pub reliable: bool,
}

/// Reusable set of timing queries on one device.
#[derive(Debug)]
pub struct GpuTimer {
    device: Device,
    disjoint: QueryId,
    start: QueryId,
    end: QueryId,
}

impl GpuTimer {
    /// # Errors
    ///
    /// Returns [`ComputeError::FeatureNotSupported`] if the backend has no timestamp queries.
    pub fn new(device: &Device) -> ComputeResult<Self> {
        let backend = device.backend();
        let disjoint = backend.create_query(QueryKind::TimestampDisjoint)?;
        let start = match backend.create_query(QueryKind::Timestamp) {
            Ok(query) => query,
            Err(e) => {
                backend.release_query(disjoint);
                return Err(e);
            }
        };
        let end = match backend.create_query(QueryKind::Timestamp) {
            Ok(query) => query,
            Err(e) => {
                backend.release_query(start);
                backend.release_query(disjoint);
                return Err(e);
            }
        };
        Ok(Self {
            device: device.clone(),
            disjoint,
            start,
            end,
        })
    }

    /// Run `work` and report how long the GPU spent between its first and
    /// last command.
    pub fn measure(&mut self, work: impl FnOnce()) -> ComputeResult<GpuTiming> {
        let backend = self.device.backend();
        backend.begin_query(self.disjoint)?;
        backend.end_query(self.start)?;
        work();
        backend.end_query(self.end)?;
        backend.end_query(self.disjoint)?;

        let (frequency, disjoint) = match self.wait(self.disjoint)? {
            QueryData::TimestampDisjoint {
                frequency,
                disjoint,
            } => (frequency, disjoint),
            other => return Err(unexpected(other)),
        };
        let start = self.wait_timestamp(self.start)?;
        let end = self.wait_timestamp(self.end)?;

        if frequency == 0 {
            log::warn!("GPU timer reported a zero tick frequency");
            return Ok(GpuTiming {
                elapsed_micros: 0.0,
                reliable: false,
            });
        }
        let elapsed_micros = end.saturating_sub(start) as f64 * 1_000_000.0 / frequency as f64;
        log::trace!("GPU timer: {elapsed_micros:.3}us (disjoint: {disjoint})");
        Ok(GpuTiming {
            elapsed_micros,
            reliable: !disjoint,
        })
    }

    fn wait(&self, query: QueryId) -> ComputeResult<QueryData> {
        loop {
            if let Some(data) = self.device.backend().query_data(query)? {
                return Ok(data);
            }
            std::thread::yield_now();
        }
    }

    fn wait_timestamp(&self, query: QueryId) -> ComputeResult<u64> {
        match self.wait(query)? {
            QueryData::Timestamp(ticks) => Ok(ticks),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(data: QueryData) -> ComputeError {
    ComputeError::Internal(format!("query returned {data:?}"))
}

impl Drop for GpuTimer {
    fn drop(&mut self) {
        let backend = self.device.backend();
        backend.release_query(self.end);
        backend.release_query(self.start);
        backend.release_query(self.disjoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCreationFlags;
    use crate::format::TextureFormat;

    #[test]
    fn test_measure_copy() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let source = device
            .create_texture2d(256, 256, TextureFormat::R8G8B8A8Unorm)
            .unwrap();
        let mut dest = device
            .create_texture2d(256, 256, TextureFormat::R8G8B8A8Unorm)
            .unwrap();
        let mut timer = GpuTimer::new(&device).unwrap();

        let mut copied = None;
        let timing = timer
            .measure(|| copied = Some(source.copy_resource(&mut dest)))
            .unwrap();
        assert_eq!(copied, Some(Ok(())));
        assert!(timing.reliable);
        assert!(timing.elapsed_micros >= 0.0);

        let again = timer.measure(|| {}).unwrap();
        assert!(again.reliable);
    }
}
