use anyhow::Result;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// 公開ポートの割り当て管理
///
/// 割り当て時にリスナーをバインドしたまま返すので、
/// 確認からバインドまでの間に他プロセスにポートを取られることはない。
pub struct PortAllocator {
    bind_host: String,
    range: RangeInclusive<u16>,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(bind_host: impl Into<String>, range: RangeInclusive<u16>) -> Self {
        Self {
            bind_host: bind_host.into(),
            range,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// 利用可能なポートを割り当て、バインド済みのリスナーを返す
    pub async fn allocate(&self) -> Result<(u16, TcpListener)> {
        let mut allocated = self.allocated.lock().await;

        for port in self.range.clone() {
            if allocated.contains(&port) {
                continue;
            }
            if let Ok(listener) = TcpListener::bind((self.bind_host.as_str(), port)).await {
                allocated.insert(port);
                return Ok((port, listener));
            }
        }

        anyhow::bail!(
            "No available ports in range {}-{}",
            self.range.start(),
            self.range.end()
        )
    }

    /// ポートを解放
    pub async fn release(&self, port: u16) {
        self.allocated.lock().await.remove(&port);
    }
}

/// "35100-35200" 形式のポート範囲を解釈（両端を含む）
pub fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| anyhow::anyhow!("Port range must look like START-END: {}", s))?;
    let start: u16 = start.trim().parse()?;
    let end: u16 = end.trim().parse()?;
    if start > end {
        anyhow::bail!("Empty port range: {}", s);
    }
    Ok(start..=end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocate_and_release() {
        let allocator = PortAllocator::new("127.0.0.1", 35300..=35309);

        let (port1, listener1) = allocator.allocate().await.unwrap();
        assert!((35300..=35309).contains(&port1));
        assert_eq!(listener1.local_addr().unwrap().port(), port1);

        let (port2, _listener2) = allocator.allocate().await.unwrap();
        assert!((35300..=35309).contains(&port2));
        assert_ne!(port1, port2);

        // 解放してリスナーを閉じれば再度割り当て可能
        allocator.release(port1).await;
        drop(listener1);
        let (port3, _listener3) = allocator.allocate().await.unwrap();
        assert_eq!(port3, port1);
    }

    #[tokio::test]
    async fn test_port_exhaustion() {
        let allocator = PortAllocator::new("127.0.0.1", 35320..=35321);

        let (port1, listener1) = allocator.allocate().await.unwrap();
        let (_port2, _listener2) = allocator.allocate().await.unwrap();

        // 範囲は2つのみ
        let result = allocator.allocate().await;
        assert!(result.is_err());

        allocator.release(port1).await;
        drop(listener1);
        assert!(allocator.allocate().await.is_ok());
    }

    #[test]
    fn test_parse_port_range() {
        assert_eq!(parse_port_range("35100-35200").unwrap(), 35100..=35200);
        assert_eq!(parse_port_range(" 1 - 2 ").unwrap(), 1..=2);
        assert!(parse_port_range("35200-35100").is_err());
        assert!(parse_port_range("35100").is_err());
        assert!(parse_port_range("a-b").is_err());
    }

    #[test]
    fn test_port_range_includes_end() {
        let range = parse_port_range("35100-35200").unwrap();
        assert!(range.contains(&35200));
        assert_eq!(range.clone().count(), 101);

        // 1ポートだけの範囲と上限ポート
        assert_eq!(parse_port_range("35100-35100").unwrap().count(), 1);
        assert_eq!(parse_port_range("65535-65535").unwrap(), 65535..=65535);
    }

    #[tokio::test]
    async fn test_allocate_last_port_of_range() {
        let allocator = PortAllocator::new("127.0.0.1", 35330..=35330);
        let (port, _listener) = allocator.allocate().await.unwrap();
        assert_eq!(port, 35330);
        assert!(allocator.allocate().await.is_err());
    }
}
