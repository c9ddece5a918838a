/// Lock-free SPSC (Single-Producer, Single-Consumer) ring buffer carrying
/// `AudioSample`s from the ADC-ready interrupt producer to the hot-path
/// consumer that drains it into the audio detection engine.
///
/// Head and tail are kept on separate cache lines to avoid false sharing;
/// capacity is fixed and must be a power of two so index masking is a
/// single AND. Paired with `tokio::sync::Notify` for async consumer wakeup.
///
/// SPSC only: one thread may call push*(), one thread may call pop*().
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A 12-bit ADC reading paired with its capture timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AudioSample {
    /// Raw ADC value, 0..=4095.
    pub value: u16,
    pub timestamp_us: u64,
}

const CACHE_LINE: usize = 64;

#[repr(C)]
struct AudioRingBufferInner {
    head: AtomicUsize,
    _pad_head: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
    tail: AtomicUsize,
    _pad_tail: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
    slots: Box<[UnsafeCell<AudioSample>]>,
    capacity: usize,
}

// SAFETY: SPSC contract upheld by AudioProducer/AudioConsumer — head is only
// written by the producer, tail only by the consumer.
unsafe impl Send for AudioRingBufferInner {}
unsafe impl Sync for AudioRingBufferInner {}

impl AudioRingBufferInner {
    fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "capacity must be a power of two"
        );

        let slots: Vec<UnsafeCell<AudioSample>> = (0..capacity)
            .map(|_| UnsafeCell::new(AudioSample::default()))
            .collect();

        Self {
            head: AtomicUsize::new(0),
            _pad_head: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            tail: AtomicUsize::new(0),
            _pad_tail: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            slots: slots.into_boxed_slice(),
            capacity,
        }
    }

    #[inline]
    fn push(&self, sample: AudioSample) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= self.capacity {
            return false;
        }

        let idx = head & (self.capacity - 1);
        // SAFETY: only the producer writes this slot, and it is not the
        // slot the consumer is currently reading (consumer reads at tail).
        unsafe {
            *self.slots[idx].get() = sample;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }

    #[inline]
    fn pop(&self) -> Option<AudioSample> {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let idx = tail & (self.capacity - 1);
        // SAFETY: only the consumer reads this slot, and the producer has
        // already published it (head has advanced past tail).
        let sample = unsafe { *self.slots[idx].get() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Some(sample)
    }

    #[inline]
    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }
}

/// Producer half, owned by the ADC sampling task.
pub struct AudioProducer {
    inner: Arc<AudioRingBufferInner>,
    notify: Arc<tokio::sync::Notify>,
}

/// Consumer half, owned by the audio detection engine's drain loop.
pub struct AudioConsumer {
    inner: Arc<AudioRingBufferInner>,
    notify: Arc<tokio::sync::Notify>,
}

unsafe impl Send for AudioProducer {}
unsafe impl Send for AudioConsumer {}

/// Build a connected producer/consumer pair. `capacity` must be a power of two.
pub fn audio_ring_buffer(capacity: usize) -> (AudioProducer, AudioConsumer) {
    let inner = Arc::new(AudioRingBufferInner::new(capacity));
    let notify = Arc::new(tokio::sync::Notify::new());

    (
        AudioProducer {
            inner: Arc::clone(&inner),
            notify: Arc::clone(&notify),
        },
        AudioConsumer { inner, notify },
    )
}

impl AudioProducer {
    /// Enqueue a sample. Returns false if the buffer is full.
    #[inline]
    pub fn push(&self, sample: AudioSample) -> bool {
        let ok = self.inner.push(sample);
        if ok {
            self.notify.notify_one();
        }
        ok
    }

    /// Enqueue a sample, dropping the oldest unread one if full. The ADC
    /// sampling path prefers a dropped stale sample over a stalled producer.
    #[inline]
    pub fn push_overwrite(&self, sample: AudioSample) {
        if !self.inner.push(sample) {
            let tail = self.inner.tail.load(Ordering::Relaxed);
            self.inner
                .tail
                .store(tail.wrapping_add(1), Ordering::Release);
            let _ = self.inner.push(sample);
        }
        self.notify.notify_one();
    }
}

impl AudioConsumer {
    #[inline]
    pub fn try_pop(&self) -> Option<AudioSample> {
        self.inner.pop()
    }

    /// Wait for the next sample.
    pub async fn pop(&self) -> AudioSample {
        loop {
            if let Some(sample) = self.inner.pop() {
                return sample;
            }
            self.notify.notified().await;
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&self, mut f: impl FnMut(AudioSample)) {
        while let Some(sample) = self.inner.pop() {
            f(sample);
        }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(value: u16, ts: u64) -> AudioSample {
        AudioSample {
            value,
            timestamp_us: ts,
        }
    }

    #[test]
    fn push_pop_basic() {
        let (producer, consumer) = audio_ring_buffer(16);
        assert!(producer.push(sample(2048, 100)));
        assert_eq!(consumer.try_pop().unwrap(), sample(2048, 100));
    }

    #[test]
    fn empty_returns_none() {
        let (_producer, consumer) = audio_ring_buffer(16);
        assert!(consumer.try_pop().is_none());
    }

    #[test]
    fn full_buffer_rejects() {
        let (producer, _consumer) = audio_ring_buffer(4);
        for i in 0..4 {
            assert!(producer.push(sample(i, i as u64)));
        }
        assert!(!producer.push(sample(99, 99)));
    }

    #[test]
    fn overwrite_drops_oldest() {
        let (producer, consumer) = audio_ring_buffer(4);
        for i in 0..4u16 {
            producer.push_overwrite(sample(i, i as u64));
        }
        producer.push_overwrite(sample(4, 4));

        let s = consumer.try_pop().unwrap();
        assert_eq!(s.value, 1);
    }

    #[test]
    fn fifo_order() {
        let (producer, consumer) = audio_ring_buffer(16);
        for i in 0..10u16 {
            producer.push(sample(i, i as u64));
        }
        for i in 0..10u16 {
            assert_eq!(consumer.try_pop().unwrap().value, i);
        }
        assert!(consumer.try_pop().is_none());
    }

    #[test]
    fn wraparound() {
        let (producer, consumer) = audio_ring_buffer(4);
        for round in 0..10u64 {
            for j in 0..4u16 {
                assert!(producer.push(sample(j, round)));
            }
            for j in 0..4u16 {
                let s = consumer.try_pop().unwrap();
                assert_eq!(s.value, j);
                assert_eq!(s.timestamp_us, round);
            }
        }
    }

    #[tokio::test]
    async fn async_pop_wakes_on_push() {
        let (producer, consumer) = audio_ring_buffer(16);
        let handle = tokio::spawn(async move {
            let s = consumer.pop().await;
            assert_eq!(s.value, 3000);
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(producer.push(sample(3000, 1)));
        handle.await.unwrap();
    }

    #[test]
    fn drain_collects_all() {
        let (producer, consumer) = audio_ring_buffer(64);
        for i in 0..10u16 {
            producer.push(sample(i, i as u64));
        }
        let mut collected = Vec::new();
        consumer.drain(|s| collected.push(s.value));
        assert_eq!(collected, (0..10).collect::<Vec<_>>());
        assert_eq!(consumer.available(), 0);
    }
}
