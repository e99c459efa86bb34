use crate::constants::CANNED_FALLBACK;
use std::collections::HashMap;

lazy_static::lazy_static! {
    static ref CANNED_REPLIES: HashMap<&'static str, &'static str> = HashMap::from([
        ("hello", "Hi there! How can I assist you today?"),
        ("how are you", "I'm just a bot, but I'm doing great! How about you?"),
        ("what is your name", "I'm your friendly AI assistant created by Hussain 🤖"),
        ("what can you do", "I can answer your questions and help you with basic information."),
        ("what is html", "HTML stands for HyperText Markup Language and is used to create web pages."),
        ("what is css", "CSS stands for Cascading Style Sheets and is used to style web pages."),
        ("what is javascript", "JavaScript is a programming language used to make web pages interactive."),
        ("what is react", "React is a JavaScript library for building user interfaces, created by Facebook."),
        ("what is node js", "Node.js is a runtime environment that allows JavaScript to run on the server side."),
        ("what is express js", "Express is a minimal and flexible Node.js web framework for building APIs."),
        ("what is mongodb", "MongoDB is a NoSQL database that stores data in JSON-like documents."),
        ("what is api", "API stands for Application Programming Interface. It allows communication between software systems."),
        ("what is frontend", "Frontend is the part of a website that users interact with directly."),
        ("what is backend", "Backend refers to the server-side logic, databases, and APIs that power applications."),
        ("what is full stack", "Full stack development involves both frontend and backend technologies."),
        ("who created you", "I was created by Hussain while learning how to build chatbots!"),
        ("thank you", "You're welcome! 😊"),
        ("bye", "Goodbye! Have a nice day 🌸"),
    ]);
}

/// Lookup key for a prompt: lowercased and trimmed.
pub fn normalize(prompt: &str) -> String {
    prompt.trim().to_lowercase()
}

pub fn canned_reply(prompt: &str) -> &'static str {
    CANNED_REPLIES
        .get(normalize(prompt).as_str())
        .copied()
        .unwrap_or(CANNED_FALLBACK)
}
