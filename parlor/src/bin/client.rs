//! A minimal line-oriented terminal client for manual testing.
//!
//! One thread prints everything the server sends; the main thread reads
//! stdin and sends each line as one frame.

use byteorder::{BigEndian, ReadBytesExt};
use parlor::net::codec;
use std::io::{self, BufRead, Read};
use std::net::{Shutdown, TcpStream};
use std::thread;

fn main() -> io::Result<()> {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", parlor::LISTEN_PORT));
    let mut stream = TcpStream::connect(&addr)?;
    println!("已连接到 {}，请使用 /register 或 /login 登录。", addr);

    let reader = stream.try_clone()?;
    let receiver = thread::spawn(move || receive_loop(reader));

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if let Err(err) = codec::write_frame(&mut stream, &line) {
            eprintln!("发送失败: {}", err);
            break;
        }
        if line.trim() == "/quit" {
            break;
        }
    }

    let _ = stream.shutdown(Shutdown::Both);
    let _ = receiver.join();
    Ok(())
}

fn receive_loop(mut stream: TcpStream) {
    loop {
        let advertised = match stream.read_u32::<BigEndian>() {
            Ok(advertised) => advertised as usize,
            Err(_) => {
                println!("服务器已关闭连接");
                return;
            }
        };

        let mut payload = vec![0u8; advertised];
        if stream.read_exact(&mut payload).is_err() {
            println!("服务器已断开连接");
            return;
        }

        match String::from_utf8(payload) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("<收到非法消息>"),
        }
    }
}
