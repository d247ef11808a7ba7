// Copyright (c) 2025 The Estaminet developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use estaminet::{Response, Router, Server};

fn main() {
    env_logger::init();

    let mut router = Router::new();
    router
        .get("/", |_ctx, _request, _bindings| {
            Response::html("<h1>hello world</h1>")
        })
        .unwrap();
    router
        .get("/users/:id{^[0-9]+$<Int>}", |_ctx, _request, bindings| {
            Response::text(format!("user #{}", bindings.get("id").unwrap()))
        })
        .unwrap();
    router
        .post("/echo", |_ctx, _request, _bindings| {
            // Streams the request body straight back, chunked.
            Response::stream(|input, output| {
                let mut buffer = [0u8; 4096];
                loop {
                    let n = std::io::Read::read(input, &mut buffer)?;
                    if n == 0 {
                        return Ok(());
                    }
                    output.write(&buffer[..n])?;
                }
            })
        })
        .unwrap();
    router
        .get("/report", |_ctx, _request, _bindings| {
            // The write phase of this response runs on the bounded
            // `reports` queue instead of the connection worker.
            Response::text("generated on the reports queue").on_queue("reports")
        })
        .unwrap();

    let server = Server::builder("127.0.0.1:8000")
        .queue_limit("reports", 2)
        .start(router)
        .unwrap();

    println!("listening on http://{}", server.server_addr());
    server.run();
}
